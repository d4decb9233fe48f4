//! End-to-end monitor behaviour against fake device tree and toggle command.
//!
//! Every test runs on a paused clock so poll ticks and settle windows are
//! deterministic.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use usb_sentry::domain::{Change, DeviceField, DeviceId, TrackedDevice};
use usb_sentry::enumerate::{DeviceProbe, DeviceStatus};
use usb_sentry::monitor::{
    EnforceAction, EnforceOutcome, Monitor, MonitorError, MonitorEvent, MonitorHandle,
    MonitorSettings,
};
use usb_sentry::power::{PowerEvent, PowerListener};
use usb_sentry::store::{
    Directory, DirectoryEntry, DirectoryStore, MemoryDirectoryStore, StoreError,
    TomlDirectoryStore,
};
use usb_sentry::toggle::{ToggleError, ToggleExecutor};

fn id(s: &str) -> DeviceId {
    DeviceId::new(s).unwrap()
}

fn directory(auto_enforce: bool, ids: &[&str]) -> Directory {
    Directory {
        auto_enforce,
        devices: ids
            .iter()
            .map(|s| DirectoryEntry {
                id: id(s),
                name: format!("Device {s}"),
            })
            .collect(),
    }
}

/// Device tree whose contents the test edits directly.
#[derive(Default)]
struct FakeProbe {
    devices: Mutex<HashMap<DeviceId, DeviceStatus>>,
    /// Time between reading the tree and answering.
    query_delay: Duration,
}

impl FakeProbe {
    fn with_query_delay(query_delay: Duration) -> Self {
        Self {
            query_delay,
            ..Self::default()
        }
    }

    fn set(&self, device: &str, present: bool, enabled: bool) {
        self.devices
            .lock()
            .unwrap()
            .insert(id(device), DeviceStatus { present, enabled });
    }

    fn unplug(&self, device: &str) {
        self.devices.lock().unwrap().remove(&id(device));
    }

    fn apply_toggle(&self, device: &DeviceId, enabled: bool) {
        if let Some(status) = self.devices.lock().unwrap().get_mut(device) {
            status.enabled = enabled;
        }
    }
}

#[async_trait]
impl DeviceProbe for FakeProbe {
    async fn query_device(&self, id: &DeviceId) -> DeviceStatus {
        let status = self
            .devices
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or(DeviceStatus::ABSENT);
        if !self.query_delay.is_zero() {
            tokio::time::sleep(self.query_delay).await;
        }
        status
    }

    async fn resolve_display_name(&self, id: &DeviceId) -> String {
        format!("Fake {id}")
    }
}

/// Toggle command that records calls and detects same-id overlap.
struct FakeExecutor {
    probe: Arc<FakeProbe>,
    delay: Duration,
    calls: Mutex<Vec<(DeviceId, bool)>>,
    failing: Mutex<HashSet<DeviceId>>,
    in_flight: Mutex<HashSet<DeviceId>>,
    overlapped: AtomicBool,
}

impl FakeExecutor {
    fn new(probe: Arc<FakeProbe>, delay: Duration) -> Self {
        Self {
            probe,
            delay,
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashSet::new()),
            overlapped: AtomicBool::new(false),
        }
    }

    fn fail_for(&self, device: &str) {
        self.failing.lock().unwrap().insert(id(device));
    }

    fn calls(&self) -> Vec<(DeviceId, bool)> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, enable: bool) -> usize {
        self.calls().iter().filter(|(_, e)| *e == enable).count()
    }
}

#[async_trait]
impl ToggleExecutor for FakeExecutor {
    async fn set_enabled(&self, id: &DeviceId, enable: bool) -> Result<(), ToggleError> {
        self.calls.lock().unwrap().push((id.clone(), enable));
        if !self.in_flight.lock().unwrap().insert(id.clone()) {
            self.overlapped.store(true, Ordering::SeqCst);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.lock().unwrap().remove(id);

        let action = usb_sentry::domain::ToggleAction::from_enabled(enable);
        if self.failing.lock().unwrap().contains(id) {
            return Err(ToggleError::Exec {
                action,
                id: id.clone(),
                code: Some(1),
                stderr: "Access is denied.".to_string(),
            });
        }

        self.probe.apply_toggle(id, enable);
        Ok(())
    }
}

/// Store whose load always fails.
#[derive(Default)]
struct BrokenStore {
    saves: AtomicUsize,
}

impl DirectoryStore for BrokenStore {
    fn load(&self) -> Result<Directory, StoreError> {
        Err(StoreError::Io {
            path: "devices.toml".into(),
            source: std::io::Error::other("disk on fire"),
        })
    }

    fn save(&self, _directory: &Directory) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Spawn a monitor over `store` with an empty device tree.
fn start_on(store: Arc<dyn DirectoryStore>) -> (MonitorHandle, JoinHandle<()>) {
    let probe: Arc<FakeProbe> = Arc::default();
    let executor = Arc::new(FakeExecutor::new(Arc::clone(&probe), Duration::ZERO));
    Monitor::new(
        MonitorSettings::default(),
        probe,
        executor,
        store,
        CancellationToken::new(),
    )
    .spawn()
}

const HAND_EDITED_WITH_TYPO: &str = r#"auto_enforce = true

[[devices]]
id = "1-1"
name = "Stick"

[[devices]]
id = "1-2
name = "Pedals"
"#;

struct Harness {
    handle: MonitorHandle,
    task: JoinHandle<()>,
    probe: Arc<FakeProbe>,
    executor: Arc<FakeExecutor>,
    store: Arc<MemoryDirectoryStore>,
    events: broadcast::Receiver<MonitorEvent>,
    cancel: CancellationToken,
}

impl Harness {
    async fn start(directory: Directory, probe: FakeProbe) -> Self {
        Self::start_with_delay(directory, probe, Duration::ZERO).await
    }

    async fn start_with_delay(directory: Directory, probe: FakeProbe, delay: Duration) -> Self {
        let probe = Arc::new(probe);
        let executor = Arc::new(FakeExecutor::new(Arc::clone(&probe), delay));
        let store = Arc::new(MemoryDirectoryStore::new(directory));
        let cancel = CancellationToken::new();

        let monitor = Monitor::new(
            MonitorSettings::default(),
            probe.clone(),
            executor.clone(),
            store.clone(),
            cancel.clone(),
        );
        let events = monitor.handle().subscribe();
        let (handle, task) = monitor.spawn();
        settle().await;

        Self {
            handle,
            task,
            probe,
            executor,
            store,
            events,
            cancel,
        }
    }

    async fn device(&self, device: &str) -> TrackedDevice {
        let wanted = id(device);
        self.handle
            .devices()
            .await
            .unwrap()
            .into_iter()
            .find(|d| d.id() == &wanted)
            .unwrap()
    }

    async fn assert_invariant(&self) {
        for device in self.handle.devices().await.unwrap() {
            assert!(
                device.connected() || !device.active(),
                "{} is active while disconnected",
                device.id()
            );
        }
    }

    fn drain(&mut self) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn drain_changes(&mut self) -> Vec<Change> {
        self.drain()
            .into_iter()
            .filter_map(|event| match event {
                MonitorEvent::FieldChanged(change) => Some(change),
                _ => None,
            })
            .collect()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Let spawned work run without crossing a poll tick.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_startup_observes_without_debounce() {
    let probe = FakeProbe::default();
    probe.set("1-1", true, true);
    probe.set("1-2", true, false);
    let h = Harness::start(directory(false, &["1-1", "1-2", "1-3"]), probe).await;

    let a = h.device("1-1").await;
    assert!(a.connected() && a.active());
    let b = h.device("1-2").await;
    assert!(b.connected() && !b.active());
    let c = h.device("1-3").await;
    assert!(!c.connected() && !c.active());

    assert!(h.executor.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_startup_enables_all_when_policy_on() {
    let probe = FakeProbe::default();
    probe.set("1-1", true, false);
    let h = Harness::start(directory(true, &["1-1", "1-2"]), probe).await;

    let mut calls = h.executor.calls();
    calls.sort();
    assert_eq!(calls, vec![(id("1-1"), true), (id("1-2"), true)]);

    assert!(h.device("1-1").await.active());
    // Armed but not present: stays inactive.
    assert!(!h.device("1-2").await.active());
    h.assert_invariant().await;
}

#[tokio::test(start_paused = true)]
async fn test_flicker_is_discarded() {
    let probe = FakeProbe::default();
    probe.set("1-1", true, true);
    let mut h = Harness::start(directory(false, &["1-1"]), probe).await;
    h.drain();

    h.probe.unplug("1-1");
    tokio::time::sleep(Duration::from_millis(1500)).await;
    h.probe.set("1-1", true, true);
    tokio::time::sleep(Duration::from_secs(7)).await;

    assert!(h.drain_changes().is_empty());
    let device = h.device("1-1").await;
    assert!(device.connected() && device.active());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_commits_after_window() {
    let probe = FakeProbe::default();
    probe.set("1-1", true, true);
    let mut h = Harness::start(directory(false, &["1-1"]), probe).await;
    h.drain();

    h.probe.unplug("1-1");
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(h.device("1-1").await.connected());

    tokio::time::sleep(Duration::from_secs(5)).await;
    let device = h.device("1-1").await;
    assert!(!device.connected());
    assert!(!device.active());

    let fields: Vec<_> = h.drain_changes().iter().map(|c| (c.field, c.new)).collect();
    assert_eq!(
        fields,
        vec![(DeviceField::Connected, false), (DeviceField::Active, false)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_debounce_is_per_device() {
    let probe = FakeProbe::default();
    probe.set("1-1", true, true);
    let mut h = Harness::start(directory(false, &["1-1", "1-2"]), probe).await;
    h.drain();

    // 1-1 starts settling; 1-2 connecting a second later settles on its own clock.
    h.probe.unplug("1-1");
    tokio::time::sleep(Duration::from_millis(1500)).await;
    h.probe.set("1-2", true, false);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(!h.device("1-1").await.connected());
    assert!(!h.device("1-2").await.connected());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.device("1-2").await.connected());
    h.assert_invariant().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_is_not_a_policy_trigger() {
    let h = Harness::start(directory(true, &["X"]), FakeProbe::default()).await;
    assert_eq!(h.executor.calls(), vec![(id("X"), true)]);
    assert!(!h.device("X").await.active());

    h.probe.set("X", true, false);
    tokio::time::sleep(Duration::from_secs(7)).await;

    let device = h.device("X").await;
    assert!(device.connected());
    assert!(!device.active());
    assert_eq!(h.executor.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_enable_all_is_idempotent() {
    let probe = FakeProbe::default();
    probe.set("1-1", true, false);
    probe.set("1-2", true, false);
    let h = Harness::start(directory(false, &["1-1", "1-2"]), probe).await;

    let first = h.handle.enforce(EnforceAction::EnableAll).await.unwrap();
    let after_first: Vec<bool> = h
        .handle
        .devices()
        .await
        .unwrap()
        .iter()
        .map(TrackedDevice::active)
        .collect();

    let second = h.handle.enforce(EnforceAction::EnableAll).await.unwrap();
    let after_second: Vec<bool> = h
        .handle
        .devices()
        .await
        .unwrap()
        .iter()
        .map(TrackedDevice::active)
        .collect();

    let done = EnforceOutcome::Completed {
        succeeded: 2,
        failed: 0,
    };
    assert_eq!(first, done);
    assert_eq!(second, done);
    assert_eq!(after_first, vec![true, true]);
    assert_eq!(after_first, after_second);
    assert!(!h.executor.overlapped.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_enforcement_runs_once() {
    let probe = FakeProbe::default();
    probe.set("1-1", true, true);
    probe.set("1-2", true, true);
    let h = Harness::start_with_delay(
        directory(false, &["1-1", "1-2"]),
        probe,
        Duration::from_millis(500),
    )
    .await;

    let (a, b) = tokio::join!(
        h.handle.enforce(EnforceAction::DisableAll),
        h.handle.enforce(EnforceAction::DisableAll)
    );
    let mut outcomes = [a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| matches!(o, EnforceOutcome::Coalesced));

    assert_eq!(
        outcomes,
        [
            EnforceOutcome::Completed {
                succeeded: 2,
                failed: 0
            },
            EnforceOutcome::Coalesced
        ]
    );
    assert_eq!(h.executor.count(false), 2);
    assert!(!h.executor.overlapped.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_user_toggle_and_enforcement_never_overlap_per_device() {
    let probe = FakeProbe::default();
    probe.set("1-1", true, false);
    let h = Harness::start_with_delay(
        directory(false, &["1-1"]),
        probe,
        Duration::from_millis(300),
    )
    .await;

    let dev = id("1-1");
    let (toggle, pass) = tokio::join!(
        h.handle.set_device_enabled(&dev, true),
        h.handle.enforce(EnforceAction::DisableAll)
    );
    toggle.unwrap();
    pass.unwrap();

    assert_eq!(h.executor.calls().len(), 2);
    assert!(!h.executor.overlapped.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_policy_on_enables_and_poll_confirms() {
    let probe = FakeProbe::default();
    probe.set("X", true, false);
    let mut h = Harness::start(directory(false, &["X"]), probe).await;
    h.drain();

    h.handle.set_policy(true).await.unwrap();
    settle().await;

    assert_eq!(h.executor.calls(), vec![(id("X"), true)]);
    assert!(h.device("X").await.active());
    assert!(h.store.snapshot().auto_enforce);

    let changes = h.drain_changes();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].field, DeviceField::Active);
    assert!(changes[0].new);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(h.drain_changes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_policy_off_does_not_enforce() {
    let probe = FakeProbe::default();
    probe.set("X", true, true);
    let h = Harness::start(directory(true, &["X"]), probe).await;
    let before = h.executor.calls().len();

    h.handle.set_policy(false).await.unwrap();
    settle().await;

    assert_eq!(h.executor.calls().len(), before);
    assert!(!h.handle.policy().await.unwrap().auto_enforce);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_disables_then_persists_once() {
    let probe = FakeProbe::default();
    probe.set("X", true, true);
    let mut h = Harness::start(directory(true, &["X"]), probe).await;
    assert!(h.device("X").await.active());
    h.drain();

    h.handle.shutdown().await.unwrap();

    assert_eq!(h.executor.calls().last(), Some(&(id("X"), false)));
    assert_eq!(h.store.save_count(), 1);
    assert_eq!(h.store.snapshot(), directory(true, &["X"]));

    let changes = h.drain_changes();
    assert!(
        changes
            .iter()
            .any(|c| c.field == DeviceField::Active && !c.new)
    );

    assert_eq!(h.handle.devices().await, Err(MonitorError::Stopped));
    (&mut h.task).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_in_flight_pass() {
    let probe = FakeProbe::default();
    probe.set("X", true, false);
    let h = Harness::start_with_delay(directory(false, &["X"]), probe, Duration::from_secs(2))
        .await;

    let handle = h.handle.clone();
    let pass = tokio::spawn(async move { handle.enforce(EnforceAction::EnableAll).await });
    settle().await;

    h.handle.set_policy(true).await.unwrap();
    let started = tokio::time::Instant::now();
    h.handle.shutdown().await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(
        pass.await.unwrap().unwrap(),
        EnforceOutcome::Completed {
            succeeded: 1,
            failed: 0
        }
    );
    assert_eq!(h.executor.calls(), vec![(id("X"), true), (id("X"), false)]);
    // One save for the policy change, one at shutdown.
    assert_eq!(h.store.save_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_without_policy_only_persists() {
    let probe = FakeProbe::default();
    probe.set("X", true, true);
    let h = Harness::start(directory(false, &["X"]), probe).await;

    h.handle.shutdown().await.unwrap();

    assert!(h.executor.calls().is_empty());
    assert_eq!(h.store.save_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resume_with_policy_off_does_nothing() {
    let probe = FakeProbe::default();
    probe.set("X", true, true);
    let h = Harness::start(directory(false, &["X"]), probe).await;

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(
        PowerListener::new(h.handle.clone(), Duration::from_secs(1)).run(rx, h.cancel.clone()),
    );
    tx.send(PowerEvent::Resumed).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(h.executor.calls().is_empty());
    assert_eq!(
        h.handle.request_resume_enforcement().await.unwrap(),
        EnforceOutcome::Skipped
    );
    assert!(h.device("X").await.active());
}

#[tokio::test(start_paused = true)]
async fn test_resume_burst_disables_once() {
    let probe = FakeProbe::default();
    probe.set("1-1", true, true);
    probe.set("1-2", true, true);
    let h = Harness::start(directory(true, &["1-1", "1-2"]), probe).await;
    assert_eq!(h.executor.count(true), 2);

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(
        PowerListener::new(h.handle.clone(), Duration::from_secs(1)).run(rx, h.cancel.clone()),
    );
    tx.send(PowerEvent::Suspending).unwrap();
    tx.send(PowerEvent::Resumed).unwrap();
    tx.send(PowerEvent::Resumed).unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.executor.count(false), 0);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.executor.count(false), 2);
    assert!(!h.device("1-1").await.active());
    assert!(!h.device("1-2").await.active());
    h.assert_invariant().await;
}

#[tokio::test(start_paused = true)]
async fn test_toggle_failure_leaves_state_unchanged() {
    let probe = FakeProbe::default();
    probe.set("X", true, true);
    let mut h = Harness::start(directory(false, &["X"]), probe).await;
    h.executor.fail_for("X");
    h.drain();

    let err = h.handle.set_device_enabled(&id("X"), false).await.unwrap_err();
    assert!(matches!(err, MonitorError::ToggleFailed { ref detail, .. } if detail == "Access is denied."));

    settle().await;
    assert!(h.device("X").await.active());
    let events = h.drain();
    assert!(events.iter().any(|e| matches!(
        e,
        MonitorEvent::ToggleFailed { id, .. } if id.as_str() == "X"
    )));
    assert!(!events.iter().any(|e| matches!(e, MonitorEvent::FieldChanged(_))));
}

#[tokio::test(start_paused = true)]
async fn test_enforcement_failure_counts_and_keeps_state() {
    let probe = FakeProbe::default();
    probe.set("1-1", true, true);
    probe.set("1-2", true, true);
    let h = Harness::start(directory(false, &["1-1", "1-2"]), probe).await;
    h.executor.fail_for("1-2");

    let outcome = h.handle.enforce(EnforceAction::DisableAll).await.unwrap();
    assert_eq!(
        outcome,
        EnforceOutcome::Completed {
            succeeded: 1,
            failed: 1
        }
    );
    assert!(!h.device("1-1").await.active());
    assert!(h.device("1-2").await.active());
}

#[tokio::test(start_paused = true)]
async fn test_user_toggle_reconciled_from_device_tree() {
    let probe = FakeProbe::default();
    probe.set("X", true, false);
    let h = Harness::start(directory(false, &["X"]), probe).await;

    h.handle.set_device_enabled(&id("X"), true).await.unwrap();
    settle().await;
    assert!(h.device("X").await.active());

    // Changed behind our back: picked up by the next poll.
    h.probe.set("X", true, false);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!h.device("X").await.active());
}

#[tokio::test(start_paused = true)]
async fn test_add_and_remove_devices() {
    let probe = FakeProbe::default();
    probe.set("1-4", true, true);
    let h = Harness::start(directory(false, &[]), probe).await;

    let added = h.handle.add_device(id("1-4"), None).await.unwrap();
    assert_eq!(added.name(), "Fake 1-4");
    assert_eq!(
        h.handle.add_device(id("1-4"), Some("Again".into())).await,
        Err(MonitorError::DuplicateDevice(id("1-4")))
    );

    settle().await;
    let device = h.device("1-4").await;
    assert!(device.connected() && device.active());
    assert_eq!(h.store.snapshot().devices.len(), 1);

    h.handle.remove_device(&id("1-4")).await.unwrap();
    assert_eq!(
        h.handle.remove_device(&id("1-4")).await,
        Err(MonitorError::UnknownDevice(id("1-4")))
    );
    assert!(h.handle.devices().await.unwrap().is_empty());
    assert!(h.store.snapshot().devices.is_empty());
    assert_eq!(h.store.save_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_toggle_unknown_device() {
    let h = Harness::start(directory(false, &[]), FakeProbe::default()).await;
    assert_eq!(
        h.handle.set_device_enabled(&id("9-9"), true).await,
        Err(MonitorError::UnknownDevice(id("9-9")))
    );
    assert!(h.executor.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reload_applies_directory_diff() {
    let probe = FakeProbe::default();
    probe.set("1-1", true, true);
    probe.set("1-2", true, false);
    let h = Harness::start(directory(false, &["1-1"]), probe).await;

    h.store.save(&directory(true, &["1-2"])).unwrap();
    h.handle.reload(h.store.load().unwrap());
    settle().await;

    let devices = h.handle.devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id(), &id("1-2"));
    assert!(h.handle.policy().await.unwrap().auto_enforce);
    assert_eq!(h.executor.calls(), vec![(id("1-2"), true)]);
    assert!(h.device("1-2").await.active());
}

#[tokio::test(start_paused = true)]
async fn test_load_failure_starts_empty() {
    let probe: Arc<FakeProbe> = Arc::default();
    let executor = Arc::new(FakeExecutor::new(Arc::clone(&probe), Duration::ZERO));
    let monitor = Monitor::new(
        MonitorSettings::default(),
        probe,
        executor,
        Arc::new(BrokenStore::default()),
        CancellationToken::new(),
    );
    let mut events = monitor.handle().subscribe();
    let (handle, _task) = monitor.spawn();
    settle().await;

    assert!(matches!(
        events.try_recv(),
        Ok(MonitorEvent::PersistenceFailed { .. })
    ));
    assert!(handle.devices().await.unwrap().is_empty());
    assert!(!handle.policy().await.unwrap().auto_enforce);
}

#[tokio::test(start_paused = true)]
async fn test_load_failure_leaves_store_untouched() {
    let store = Arc::new(BrokenStore::default());
    let (handle, task) = start_on(store.clone());
    settle().await;

    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(store.saves.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_directory_survives_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devices.toml");
    std::fs::write(&path, HAND_EDITED_WITH_TYPO).unwrap();

    let (handle, task) = start_on(Arc::new(TomlDirectoryStore::new(&path)));
    tokio::time::sleep(Duration::from_secs(3)).await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), HAND_EDITED_WITH_TYPO);
    assert!(!dir.path().join("devices.toml.bak").exists());
}

#[tokio::test(start_paused = true)]
async fn test_first_edit_after_unreadable_directory_keeps_backup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devices.toml");
    std::fs::write(&path, HAND_EDITED_WITH_TYPO).unwrap();

    let (handle, _task) = start_on(Arc::new(TomlDirectoryStore::new(&path)));
    settle().await;
    handle
        .add_device(id("1-3"), Some("Keypad".to_string()))
        .await
        .unwrap();

    assert_eq!(
        std::fs::read_to_string(dir.path().join("devices.toml.bak")).unwrap(),
        HAND_EDITED_WITH_TYPO
    );
    let saved = TomlDirectoryStore::new(&path).load().unwrap();
    assert_eq!(
        saved.devices,
        vec![DirectoryEntry {
            id: id("1-3"),
            name: "Keypad".to_string(),
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_fixed_directory_file_is_picked_up() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devices.toml");
    std::fs::write(&path, HAND_EDITED_WITH_TYPO).unwrap();

    let (handle, _task) = start_on(Arc::new(TomlDirectoryStore::new(&path)));
    settle().await;
    assert!(handle.devices().await.unwrap().is_empty());

    std::fs::write(&path, HAND_EDITED_WITH_TYPO.replace("\"1-2\n", "\"1-2\"\n")).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let ids: Vec<DeviceId> = handle
        .devices()
        .await
        .unwrap()
        .iter()
        .map(|d| d.id().clone())
        .collect();
    assert_eq!(ids, vec![id("1-1"), id("1-2")]);
    assert!(handle.policy().await.unwrap().auto_enforce);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_keeps_edits_made_to_the_store() {
    let probe = FakeProbe::default();
    probe.set("1-1", true, true);
    probe.set("1-2", true, true);
    let h = Harness::start(directory(false, &["1-1"]), probe).await;

    // Edited by the CLI while the monitor runs.
    h.store.save(&directory(true, &["1-1", "1-2"])).unwrap();
    h.handle.shutdown().await.unwrap();

    assert_eq!(h.store.snapshot(), directory(true, &["1-1", "1-2"]));
    let mut calls = h.executor.calls();
    calls.sort();
    assert_eq!(calls, vec![(id("1-1"), false), (id("1-2"), false)]);
}

#[tokio::test(start_paused = true)]
async fn test_store_edits_are_applied_on_the_next_tick() {
    let probe = FakeProbe::default();
    probe.set("1-1", true, true);
    probe.set("1-2", true, false);
    let h = Harness::start(directory(false, &["1-1"]), probe).await;

    h.store.save(&directory(true, &["1-2"])).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    settle().await;

    let devices = h.handle.devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id(), &id("1-2"));
    assert!(h.handle.policy().await.unwrap().auto_enforce);
    assert_eq!(h.executor.calls(), vec![(id("1-2"), true)]);
    assert!(h.device("1-2").await.active());
}

#[tokio::test(start_paused = true)]
async fn test_monitor_edit_merges_store_edit() {
    let probe = FakeProbe::default();
    probe.set("1-1", true, true);
    let h = Harness::start(directory(false, &["1-1"]), probe).await;

    h.store.save(&directory(false, &["1-1", "1-2"])).unwrap();
    h.handle
        .add_device(id("1-3"), Some("Device 1-3".to_string()))
        .await
        .unwrap();

    assert_eq!(h.store.snapshot(), directory(false, &["1-1", "1-2", "1-3"]));
}

#[tokio::test(start_paused = true)]
async fn test_sample_taken_before_enforcement_does_not_undo_it() {
    let probe = FakeProbe::with_query_delay(Duration::from_millis(600));
    probe.set("X", true, false);
    let mut h = Harness::start(directory(false, &["X"]), probe).await;

    // A tick at 1.6s starts a sample that reads the tree before the pass.
    tokio::time::sleep(Duration::from_millis(1650)).await;
    h.drain();

    let outcome = h.handle.enforce(EnforceAction::EnableAll).await.unwrap();
    assert_eq!(
        outcome,
        EnforceOutcome::Completed {
            succeeded: 1,
            failed: 0
        }
    );
    tokio::time::sleep(Duration::from_secs(2)).await;

    let fields: Vec<_> = h.drain_changes().iter().map(|c| (c.field, c.new)).collect();
    assert_eq!(fields, vec![(DeviceField::Active, true)]);
    assert!(h.device("X").await.active());
}

#[tokio::test(start_paused = true)]
async fn test_resume_during_enable_all_disables_afterwards() {
    let probe = FakeProbe::default();
    probe.set("X", true, false);
    let h = Harness::start_with_delay(directory(true, &["X"]), probe, Duration::from_secs(2))
        .await;

    let outcome = h.handle.request_resume_enforcement().await.unwrap();

    assert_eq!(
        outcome,
        EnforceOutcome::Completed {
            succeeded: 1,
            failed: 0
        }
    );
    assert_eq!(h.executor.calls(), vec![(id("X"), true), (id("X"), false)]);
    assert!(!h.executor.overlapped.load(Ordering::SeqCst));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!h.device("X").await.active());
}

#[tokio::test(start_paused = true)]
async fn test_one_opposite_pass_is_queued() {
    let probe = FakeProbe::default();
    probe.set("X", true, false);
    let h = Harness::start_with_delay(directory(true, &["X"]), probe, Duration::from_secs(2))
        .await;

    let (first, second, same) = tokio::join!(
        h.handle.enforce(EnforceAction::DisableAll),
        h.handle.enforce(EnforceAction::DisableAll),
        h.handle.enforce(EnforceAction::EnableAll)
    );
    let mut disables = [first.unwrap(), second.unwrap()];
    disables.sort_by_key(|o| matches!(o, EnforceOutcome::Coalesced));

    assert_eq!(
        disables,
        [
            EnforceOutcome::Completed {
                succeeded: 1,
                failed: 0
            },
            EnforceOutcome::Coalesced
        ]
    );
    assert_eq!(same.unwrap(), EnforceOutcome::Coalesced);
    assert_eq!(h.executor.calls(), vec![(id("X"), true), (id("X"), false)]);
}
