//! Device state monitor.
//!
//! A single task owns every [`TrackedDevice`] and the policy. Poll samples,
//! debounce results, toggle outcomes and user requests all arrive as
//! [`Command`]s on one channel and are applied in order, so no two writers
//! ever race. Anything that waits (enumeration, settle windows, external
//! commands) runs in spawned tasks that report back through the same channel.

mod guard;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::debounce::{DebounceDecision, DebounceTracker};
use crate::domain::{Change, DeviceId, MonitorPolicy, ToggleAction, TrackedDevice};
use crate::enumerate::{DeviceProbe, DeviceStatus};
use crate::store::{Directory, DirectoryEntry, DirectoryStore};
use crate::toggle::{ToggleError, ToggleExecutor};

pub use guard::{DeviceLocks, EnforcementGuard, EnforcementToken};

/// Capacity of the observer broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Timing knobs for the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Period of the poll cycle.
    pub poll_interval: Duration,
    /// Settle window before a presence change is committed.
    pub debounce: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            debounce: Duration::from_secs(5),
        }
    }
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            debounce: config.debounce(),
        }
    }
}

/// Bulk policy application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforceAction {
    EnableAll,
    DisableAll,
}

impl EnforceAction {
    fn toggle(self) -> ToggleAction {
        match self {
            Self::EnableAll => ToggleAction::Enable,
            Self::DisableAll => ToggleAction::Disable,
        }
    }
}

impl fmt::Display for EnforceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnableAll => f.write_str("enable-all"),
            Self::DisableAll => f.write_str("disable-all"),
        }
    }
}

/// Result of an enforcement request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforceOutcome {
    /// The pass ran to completion.
    Completed { succeeded: usize, failed: usize },
    /// A pass with the same action was already running or queued (or
    /// shutdown began); this one was dropped.
    Coalesced,
    /// Policy does not call for enforcement.
    Skipped,
}

/// Change notifications for observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    FieldChanged(Change),
    DeviceAdded {
        id: DeviceId,
        name: String,
    },
    DeviceRemoved {
        id: DeviceId,
    },
    PolicyChanged {
        auto_enforce: bool,
    },
    EnforcementStarted {
        action: EnforceAction,
    },
    EnforcementFinished {
        action: EnforceAction,
        succeeded: usize,
        failed: usize,
    },
    ToggleFailed {
        id: DeviceId,
        action: String,
        detail: String,
    },
    PersistenceFailed {
        detail: String,
    },
    SubscriptionFailed {
        detail: String,
    },
}

/// Errors returned to callers of [`MonitorHandle`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    #[error("Device {0} is already tracked")]
    DuplicateDevice(DeviceId),

    #[error("Device {0} is not tracked")]
    UnknownDevice(DeviceId),

    #[error("Failed to {action} device {id}: {detail}")]
    ToggleFailed {
        id: DeviceId,
        action: ToggleAction,
        detail: String,
    },

    #[error("Monitor is not running")]
    Stopped,
}

impl From<&ToggleError> for MonitorError {
    fn from(e: &ToggleError) -> Self {
        Self::ToggleFailed {
            id: e.id().clone(),
            action: e.action(),
            detail: e.detail(),
        }
    }
}

/// Who issued a toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToggleOrigin {
    Enforcement,
    User,
}

/// Messages processed by the monitor task.
enum Command {
    Devices(oneshot::Sender<Vec<TrackedDevice>>),
    Policy(oneshot::Sender<MonitorPolicy>),
    AddDevice {
        id: DeviceId,
        name: String,
        reply: oneshot::Sender<Result<TrackedDevice, MonitorError>>,
    },
    RemoveDevice {
        id: DeviceId,
        reply: oneshot::Sender<Result<(), MonitorError>>,
    },
    SetDeviceEnabled {
        id: DeviceId,
        enable: bool,
        reply: oneshot::Sender<Result<(), MonitorError>>,
    },
    SetPolicy {
        auto_enforce: bool,
        reply: oneshot::Sender<()>,
    },
    Enforce {
        action: EnforceAction,
        reply: Option<oneshot::Sender<EnforceOutcome>>,
    },
    Resume {
        reply: Option<oneshot::Sender<EnforceOutcome>>,
    },
    PollNow,
    Reload(Directory),
    Shutdown(oneshot::Sender<()>),

    // Reports from spawned work.
    Sampled {
        id: DeviceId,
        status: DeviceStatus,
        generation: u64,
    },
    Debounced {
        id: DeviceId,
        status: DeviceStatus,
    },
    ToggleFinished {
        id: DeviceId,
        action: ToggleAction,
        origin: ToggleOrigin,
        result: Result<(), ToggleError>,
    },
    EnforcementDone {
        action: EnforceAction,
        succeeded: usize,
        failed: usize,
        token: EnforcementToken,
        reply: Option<oneshot::Sender<EnforceOutcome>>,
    },
}

/// An enforcement request waiting for the running pass to finish.
struct QueuedPass {
    action: EnforceAction,
    reply: Option<oneshot::Sender<EnforceOutcome>>,
}

/// Whether the run loop keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Progress of the close sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownState {
    Running,
    /// Waiting for an in-flight pass to finish.
    Draining,
    /// Running the final disable-all.
    Disabling,
}

/// Cloneable front end to a running monitor.
#[derive(Clone)]
pub struct MonitorHandle {
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<MonitorEvent>,
    probe: Arc<dyn DeviceProbe>,
}

impl MonitorHandle {
    /// Receive every change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the tracked devices.
    pub async fn devices(&self) -> Result<Vec<TrackedDevice>, MonitorError> {
        self.request(Command::Devices).await
    }

    pub async fn policy(&self) -> Result<MonitorPolicy, MonitorError> {
        self.request(Command::Policy).await
    }

    /// Track a new device. Without a name, the device tree is asked for one.
    pub async fn add_device(
        &self,
        id: DeviceId,
        name: Option<String>,
    ) -> Result<TrackedDevice, MonitorError> {
        let name = match name {
            Some(name) => name,
            None => self.probe.resolve_display_name(&id).await,
        };
        self.request(|reply| Command::AddDevice { id, name, reply })
            .await?
    }

    pub async fn remove_device(&self, id: &DeviceId) -> Result<(), MonitorError> {
        let id = id.clone();
        self.request(|reply| Command::RemoveDevice { id, reply })
            .await?
    }

    /// Toggle one device. Resolves once the external command has finished;
    /// the observed state follows on the next poll.
    pub async fn set_device_enabled(&self, id: &DeviceId, enable: bool) -> Result<(), MonitorError> {
        let id = id.clone();
        self.request(|reply| Command::SetDeviceEnabled { id, enable, reply })
            .await?
    }

    /// Change the auto-enforce policy. Switching it on starts an enable-all.
    pub async fn set_policy(&self, auto_enforce: bool) -> Result<(), MonitorError> {
        self.request(|reply| Command::SetPolicy {
            auto_enforce,
            reply,
        })
        .await
    }

    /// Run an enforcement pass and wait for it.
    pub async fn enforce(&self, action: EnforceAction) -> Result<EnforceOutcome, MonitorError> {
        self.request(|reply| Command::Enforce {
            action,
            reply: Some(reply),
        })
        .await
    }

    /// Apply the resume-from-sleep policy (disable-all when auto-enforce is on).
    pub async fn request_resume_enforcement(&self) -> Result<EnforceOutcome, MonitorError> {
        self.request(|reply| Command::Resume { reply: Some(reply) })
            .await
    }

    /// Run a poll cycle without waiting for the timer.
    pub fn poll_now(&self) {
        let _ = self.tx.send(Command::PollNow);
    }

    /// Apply an externally edited directory (devices added/removed, policy).
    pub fn reload(&self, directory: Directory) {
        let _ = self.tx.send(Command::Reload(directory));
    }

    /// Report that the power-event source could not be attached.
    pub fn report_subscription_failure(&self, detail: impl Into<String>) {
        let _ = self.events.send(MonitorEvent::SubscriptionFailed {
            detail: detail.into(),
        });
    }

    /// Run the close sequence and wait for it to finish.
    pub async fn shutdown(&self) -> Result<(), MonitorError> {
        self.request(Command::Shutdown).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, MonitorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| MonitorError::Stopped)?;
        rx.await.map_err(|_| MonitorError::Stopped)
    }
}

/// The monitor task state.
pub struct Monitor {
    settings: MonitorSettings,
    probe: Arc<dyn DeviceProbe>,
    executor: Arc<dyn ToggleExecutor>,
    store: Arc<dyn DirectoryStore>,

    devices: Vec<TrackedDevice>,
    policy: MonitorPolicy,

    debounce: DebounceTracker,
    /// Devices added at runtime whose first sample commits without settling.
    unobserved: HashSet<DeviceId>,
    /// Devices with a poll sample outstanding.
    sampling: HashSet<DeviceId>,
    /// Outstanding toggle commands per device.
    busy: HashMap<DeviceId, usize>,
    /// Bumped when a toggle starts or finishes. Samples stamped with an older
    /// value are dropped.
    generations: HashMap<DeviceId, u64>,
    locks: DeviceLocks,
    guard: EnforcementGuard,
    running: Option<EnforceAction>,
    queued: Option<QueuedPass>,

    /// Directory as last loaded from or written to the store. `None` while the
    /// store holds something unreadable.
    synced: Option<Directory>,

    shutdown: ShutdownState,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    startup_errors: Vec<String>,

    tx: mpsc::UnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<MonitorEvent>,
    cancel: CancellationToken,
}

impl Monitor {
    /// Build a monitor from the stored directory. Load failures fall back to
    /// an empty directory with the policy off, and the store is left alone
    /// until the directory is edited.
    pub fn new(
        settings: MonitorSettings,
        probe: Arc<dyn DeviceProbe>,
        executor: Arc<dyn ToggleExecutor>,
        store: Arc<dyn DirectoryStore>,
        cancel: CancellationToken,
    ) -> Self {
        let mut startup_errors = Vec::new();
        let (directory, synced) = match store.load() {
            Ok(directory) => (directory.clone(), Some(directory)),
            Err(e) => {
                warn!("Failed to load device directory, starting empty: {}", e);
                startup_errors.push(e.to_string());
                (Directory::default(), None)
            }
        };

        let mut devices: Vec<TrackedDevice> = Vec::with_capacity(directory.devices.len());
        for entry in directory.devices {
            if devices.iter().any(|d| d.id() == &entry.id) {
                warn!("Ignoring duplicate directory entry {}", entry.id);
                continue;
            }
            devices.push(TrackedDevice::new(entry.id, entry.name));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            settings,
            probe,
            executor,
            store,
            devices,
            policy: MonitorPolicy {
                auto_enforce: directory.auto_enforce,
            },
            debounce: DebounceTracker::new(settings.debounce),
            unobserved: HashSet::new(),
            sampling: HashSet::new(),
            busy: HashMap::new(),
            generations: HashMap::new(),
            locks: DeviceLocks::default(),
            guard: EnforcementGuard::default(),
            running: None,
            queued: None,
            synced,
            shutdown: ShutdownState::Running,
            shutdown_waiters: Vec::new(),
            startup_errors,
            tx,
            rx,
            events,
            cancel,
        }
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            tx: self.tx.clone(),
            events: self.events.clone(),
            probe: Arc::clone(&self.probe),
        }
    }

    /// Spawn the monitor task.
    pub fn spawn(self) -> (MonitorHandle, JoinHandle<()>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    /// Run until shutdown completes or the token is cancelled.
    pub async fn run(mut self) {
        info!(
            "Monitor started: {} tracked device(s), auto_enforce={}, polling every {:?}",
            self.devices.len(),
            self.policy.auto_enforce,
            self.settings.poll_interval
        );

        for detail in std::mem::take(&mut self.startup_errors) {
            self.emit(MonitorEvent::PersistenceFailed { detail });
        }

        self.initial_sample().await;

        if self.policy.auto_enforce {
            self.start_enforcement(EnforceAction::EnableAll, None);
        }

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    warn!("Monitor cancelled");
                    break;
                }

                _ = ticker.tick() => {
                    self.sync_from_store();
                    self.poll();
                }

                Some(command) = self.rx.recv() => {
                    if self.handle_command(command) == Flow::Stop {
                        break;
                    }
                }
            }
        }

        info!("Monitor stopped");
    }

    /// Establish presence and enablement before the first poll.
    async fn initial_sample(&mut self) {
        let probe = Arc::clone(&self.probe);
        let ids: Vec<DeviceId> = self.devices.iter().map(|d| d.id().clone()).collect();

        let samples = join_all(ids.into_iter().map(|id| {
            let probe = Arc::clone(&probe);
            async move {
                let status = probe.query_device(&id).await;
                (id, status)
            }
        }))
        .await;

        for (id, status) in samples {
            self.commit(&id, status);
        }
    }

    fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Devices(reply) => {
                let _ = reply.send(self.devices.clone());
            }
            Command::Policy(reply) => {
                let _ = reply.send(self.policy);
            }
            Command::AddDevice { id, name, reply } => {
                self.sync_from_store();
                let _ = reply.send(self.add_device(id, name));
            }
            Command::RemoveDevice { id, reply } => {
                self.sync_from_store();
                let _ = reply.send(self.remove_device(&id));
            }
            Command::SetDeviceEnabled { id, enable, reply } => {
                self.toggle_device(id, enable, reply);
            }
            Command::SetPolicy {
                auto_enforce,
                reply,
            } => {
                self.sync_from_store();
                self.set_policy(auto_enforce, true);
                let _ = reply.send(());
            }
            Command::Enforce { action, reply } => {
                self.start_enforcement(action, reply);
            }
            Command::Resume { reply } => self.on_resume(reply),
            Command::PollNow => self.poll(),
            Command::Reload(directory) => self.reload(directory),
            Command::Shutdown(reply) => {
                self.shutdown_waiters.push(reply);
                if self.shutdown == ShutdownState::Running {
                    info!("Shutdown requested");
                    self.shutdown = ShutdownState::Draining;
                }
                return self.advance_shutdown();
            }
            Command::Sampled {
                id,
                status,
                generation,
            } => self.on_sampled(id, status, generation),
            Command::Debounced { id, status } => self.on_debounced(&id, status),
            Command::ToggleFinished {
                id,
                action,
                origin,
                result,
            } => self.on_toggle_finished(id, action, origin, &result),
            Command::EnforcementDone {
                action,
                succeeded,
                failed,
                token,
                reply,
            } => {
                info!(
                    "Finished {}: {} succeeded, {} failed",
                    action, succeeded, failed
                );
                self.emit(MonitorEvent::EnforcementFinished {
                    action,
                    succeeded,
                    failed,
                });
                self.poll();
                drop(token);
                self.running = None;
                if let Some(reply) = reply {
                    let _ = reply.send(EnforceOutcome::Completed { succeeded, failed });
                }
                if let Some(next) = self.queued.take() {
                    self.start_enforcement(next.action, next.reply);
                }
                return self.advance_shutdown();
            }
        }
        Flow::Continue
    }

    // --- poll cycle ---

    fn poll(&mut self) {
        let due: Vec<DeviceId> = self
            .devices
            .iter()
            .map(|d| d.id().clone())
            .filter(|id| !self.debounce.is_pending(id) && !self.sampling.contains(id))
            .collect();

        for id in due {
            self.spawn_sample(id);
        }
    }

    fn spawn_sample(&mut self, id: DeviceId) {
        self.sampling.insert(id.clone());
        let generation = self.generation(&id);
        let probe = Arc::clone(&self.probe);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let status = probe.query_device(&id).await;
            let _ = tx.send(Command::Sampled {
                id,
                status,
                generation,
            });
        });
    }

    fn on_sampled(&mut self, id: DeviceId, status: DeviceStatus, generation: u64) {
        self.sampling.remove(&id);

        if generation != self.generation(&id) {
            debug!("Dropping sample of {} taken across a toggle", id);
            if self.device(&id).is_some() && !self.busy.contains_key(&id) {
                self.spawn_sample(id);
            }
            return;
        }

        let Some(device) = self.device(&id) else {
            return;
        };
        let (connected, active) = (device.connected(), device.active());

        if self.unobserved.remove(&id) {
            self.commit(&id, status);
            return;
        }

        if status.present != connected {
            if self.debounce.begin(&id, connected, status.present) {
                self.spawn_debounce(id);
            }
            return;
        }

        // Presence is settled; reflect enable state changed by a user toggle
        // or by someone else.
        if connected && active != status.enabled && !self.busy.contains_key(&id) {
            debug!("{} reports enabled={}, updating", id, status.enabled);
            let change = self
                .device_mut(&id)
                .and_then(|d| d.set_active(status.enabled));
            self.emit_changes(change);
        }
    }

    fn spawn_debounce(&self, id: DeviceId) {
        let probe = Arc::clone(&self.probe);
        let tx = self.tx.clone();
        let window = self.debounce.window();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let status = probe.query_device(&id).await;
            let _ = tx.send(Command::Debounced { id, status });
        });
    }

    fn on_debounced(&mut self, id: &DeviceId, status: DeviceStatus) {
        let Some(recorded) = self.device(id).map(TrackedDevice::connected) else {
            self.debounce.forget(id);
            return;
        };

        if self.debounce.resolve(id, recorded, status.present) == Some(DebounceDecision::Commit) {
            self.commit(id, status);
        }
    }

    /// Apply a sample as the new observed state.
    fn commit(&mut self, id: &DeviceId, status: DeviceStatus) {
        let Some(device) = self.device_mut(id) else {
            return;
        };

        let mut changes = device.set_connected(status.present);
        if status.present {
            changes.extend(device.set_active(status.enabled));
        }

        if !changes.is_empty() {
            info!(
                "{} is now {} ({})",
                id,
                if status.present { "connected" } else { "disconnected" },
                if status.present && status.enabled { "enabled" } else { "disabled" }
            );
        }
        self.emit_changes(changes);
    }

    // --- toggles ---

    fn toggle_device(
        &mut self,
        id: DeviceId,
        enable: bool,
        reply: oneshot::Sender<Result<(), MonitorError>>,
    ) {
        if self.device(&id).is_none() {
            let _ = reply.send(Err(MonitorError::UnknownDevice(id)));
            return;
        }

        let action = ToggleAction::from_enabled(enable);
        info!("User requested {} of {}", action, id);
        self.mark_busy(&id);

        let executor = Arc::clone(&self.executor);
        let locks = self.locks.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _permit = locks.acquire(&id).await;
            let result = executor.set_enabled(&id, enable).await;
            let _ = reply.send(result.as_ref().map_err(MonitorError::from).copied());
            let _ = tx.send(Command::ToggleFinished {
                id,
                action,
                origin: ToggleOrigin::User,
                result,
            });
        });
    }

    fn start_enforcement(
        &mut self,
        action: EnforceAction,
        reply: Option<oneshot::Sender<EnforceOutcome>>,
    ) {
        if self.shutdown != ShutdownState::Running {
            debug!("Dropping {} request: shutting down", action);
            if let Some(reply) = reply {
                let _ = reply.send(EnforceOutcome::Coalesced);
            }
            return;
        }

        match self.guard.try_acquire() {
            Some(token) => self.run_pass(action, token, reply),
            None => self.queue_enforcement(action, reply),
        }
    }

    /// Hold the latest request whose action differs from the running pass.
    /// Repeats of the running or queued action are coalesced.
    fn queue_enforcement(
        &mut self,
        action: EnforceAction,
        reply: Option<oneshot::Sender<EnforceOutcome>>,
    ) {
        let queued_action = self.queued.as_ref().map(|q| q.action);
        if self.running == Some(action) || queued_action == Some(action) {
            debug!("Dropping {} request: already in flight", action);
            if let Some(reply) = reply {
                let _ = reply.send(EnforceOutcome::Coalesced);
            }
            return;
        }

        info!("Queueing {} behind the running pass", action);
        if let Some(QueuedPass {
            reply: Some(superseded),
            ..
        }) = self.queued.replace(QueuedPass { action, reply })
        {
            let _ = superseded.send(EnforceOutcome::Coalesced);
        }
    }

    fn run_pass(
        &mut self,
        action: EnforceAction,
        token: EnforcementToken,
        reply: Option<oneshot::Sender<EnforceOutcome>>,
    ) {
        self.running = Some(action);
        let ids: Vec<DeviceId> = self.devices.iter().map(|d| d.id().clone()).collect();
        for id in &ids {
            self.mark_busy(id);
        }

        info!("Starting {} for {} device(s)", action, ids.len());
        self.emit(MonitorEvent::EnforcementStarted { action });

        let executor = Arc::clone(&self.executor);
        let locks = self.locks.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let toggle = action.toggle();
            let outcomes = join_all(ids.into_iter().map(|id| {
                let executor = Arc::clone(&executor);
                let locks = locks.clone();
                let tx = tx.clone();
                async move {
                    let _permit = locks.acquire(&id).await;
                    let result = executor.set_enabled(&id, toggle.is_enable()).await;
                    let ok = result.is_ok();
                    let _ = tx.send(Command::ToggleFinished {
                        id,
                        action: toggle,
                        origin: ToggleOrigin::Enforcement,
                        result,
                    });
                    ok
                }
            }))
            .await;

            let succeeded = outcomes.iter().filter(|ok| **ok).count();
            let _ = tx.send(Command::EnforcementDone {
                action,
                succeeded,
                failed: outcomes.len() - succeeded,
                token,
                reply,
            });
        });
    }

    fn on_toggle_finished(
        &mut self,
        id: DeviceId,
        action: ToggleAction,
        origin: ToggleOrigin,
        result: &Result<(), ToggleError>,
    ) {
        self.release_busy(&id);
        if self.device(&id).is_some() {
            self.bump_generation(&id);
        }

        match result {
            Ok(()) => match origin {
                ToggleOrigin::Enforcement => {
                    let change = self
                        .device_mut(&id)
                        .and_then(|d| d.set_active(action.is_enable()));
                    self.emit_changes(change);
                }
                ToggleOrigin::User => {
                    debug!("{} of {} done, refreshing", action, id);
                    if self.device(&id).is_some() && !self.sampling.contains(&id) {
                        self.spawn_sample(id);
                    }
                }
            },
            Err(e) => {
                error!("{}", e);
                self.emit(MonitorEvent::ToggleFailed {
                    id,
                    action: action.to_string(),
                    detail: e.detail(),
                });
            }
        }
    }

    fn mark_busy(&mut self, id: &DeviceId) {
        *self.busy.entry(id.clone()).or_default() += 1;
        self.bump_generation(id);
    }

    fn generation(&self, id: &DeviceId) -> u64 {
        self.generations.get(id).copied().unwrap_or_default()
    }

    fn bump_generation(&mut self, id: &DeviceId) {
        *self.generations.entry(id.clone()).or_default() += 1;
    }

    fn release_busy(&mut self, id: &DeviceId) {
        if let Some(count) = self.busy.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                self.busy.remove(id);
            }
        }
    }

    // --- policy and directory ---

    fn on_resume(&mut self, reply: Option<oneshot::Sender<EnforceOutcome>>) {
        if !self.policy.auto_enforce {
            debug!("Resume ignored: auto-enforce is off");
            if let Some(reply) = reply {
                let _ = reply.send(EnforceOutcome::Skipped);
            }
            return;
        }
        info!("Resumed from sleep, disabling tracked devices");
        self.start_enforcement(EnforceAction::DisableAll, reply);
    }

    fn set_policy(&mut self, auto_enforce: bool, persist: bool) {
        if self.policy.auto_enforce == auto_enforce {
            return;
        }
        info!("Auto-enforce {}", if auto_enforce { "on" } else { "off" });
        self.policy.auto_enforce = auto_enforce;
        self.emit(MonitorEvent::PolicyChanged { auto_enforce });

        if auto_enforce {
            self.start_enforcement(EnforceAction::EnableAll, None);
        }
        if persist {
            self.persist();
        }
    }

    fn add_device(&mut self, id: DeviceId, name: String) -> Result<TrackedDevice, MonitorError> {
        if self.device(&id).is_some() {
            return Err(MonitorError::DuplicateDevice(id));
        }

        let device = self.track(id, name);
        self.persist();
        Ok(device)
    }

    fn remove_device(&mut self, id: &DeviceId) -> Result<(), MonitorError> {
        if !self.untrack(id) {
            return Err(MonitorError::UnknownDevice(id.clone()));
        }

        self.persist();
        Ok(())
    }

    fn track(&mut self, id: DeviceId, name: String) -> TrackedDevice {
        info!("Tracking {} ({})", id, name);
        let device = TrackedDevice::new(id.clone(), name.clone());
        self.devices.push(device.clone());
        self.unobserved.insert(id.clone());
        self.emit(MonitorEvent::DeviceAdded {
            id: id.clone(),
            name,
        });

        if !self.sampling.contains(&id) {
            self.spawn_sample(id);
        }
        device
    }

    fn untrack(&mut self, id: &DeviceId) -> bool {
        let Some(index) = self.devices.iter().position(|d| d.id() == id) else {
            return false;
        };

        info!("No longer tracking {}", id);
        self.devices.remove(index);
        self.debounce.forget(id);
        self.unobserved.remove(id);
        self.generations.remove(id);
        self.locks.forget(id);
        self.emit(MonitorEvent::DeviceRemoved { id: id.clone() });
        true
    }

    /// Replace the tracked set and policy with a directory just read from the
    /// store.
    fn reload(&mut self, directory: Directory) {
        info!("Reloading directory ({} device(s))", directory.devices.len());
        let current = self.directory();
        self.apply_diff(&current, &directory);
        self.synced = Some(directory);
    }

    /// Pick up edits another process made to the store since the last sync.
    fn sync_from_store(&mut self) {
        let current = match self.store.load() {
            Ok(current) => current,
            Err(e) => {
                debug!("Directory not re-read: {}", e);
                return;
            }
        };

        match self.synced.take() {
            Some(base) if base == current => self.synced = Some(base),
            Some(base) => {
                info!("Directory changed on disk, applying");
                self.apply_diff(&base, &current);
                self.synced = Some(current);
            }
            None => {
                info!("Directory file is readable again");
                self.reload(current);
            }
        }
    }

    /// Apply what changed between two directory snapshots to the live state.
    fn apply_diff(&mut self, base: &Directory, target: &Directory) {
        for entry in &base.devices {
            if !target.contains(&entry.id) {
                self.untrack(&entry.id);
            }
        }

        for entry in &target.devices {
            if !base.contains(&entry.id) && self.device(&entry.id).is_none() {
                self.track(entry.id.clone(), entry.name.clone());
            }
        }

        if base.auto_enforce != target.auto_enforce {
            self.set_policy(target.auto_enforce, false);
        }
    }

    fn directory(&self) -> Directory {
        Directory {
            auto_enforce: self.policy.auto_enforce,
            devices: self
                .devices
                .iter()
                .map(|d| DirectoryEntry {
                    id: d.id().clone(),
                    name: d.name().to_string(),
                })
                .collect(),
        }
    }

    /// Save the live directory. Edits made to the store since the last sync
    /// are merged first, so a newer file is never written over. An unreadable
    /// file is set aside before the first save.
    fn persist(&mut self) {
        if self.synced.is_some() {
            self.sync_from_store();
        } else if let Err(e) = self.store.set_aside() {
            warn!("Not replacing unreadable device directory: {}", e);
            self.emit(MonitorEvent::PersistenceFailed {
                detail: e.to_string(),
            });
            return;
        }

        let directory = self.directory();
        match self.store.save(&directory) {
            Ok(()) => self.synced = Some(directory),
            Err(e) => {
                warn!("Failed to save device directory: {}", e);
                self.emit(MonitorEvent::PersistenceFailed {
                    detail: e.to_string(),
                });
            }
        }
    }

    // --- shutdown ---

    fn advance_shutdown(&mut self) -> Flow {
        match self.shutdown {
            ShutdownState::Running => Flow::Continue,
            _ if self.guard.is_held() => {
                debug!("Shutdown waiting for in-flight enforcement");
                Flow::Continue
            }
            ShutdownState::Draining => {
                self.sync_from_store();
                if self.policy.auto_enforce
                    && let Some(token) = self.guard.try_acquire()
                {
                    self.shutdown = ShutdownState::Disabling;
                    self.run_pass(EnforceAction::DisableAll, token, None);
                    return Flow::Continue;
                }
                self.finish_shutdown()
            }
            ShutdownState::Disabling => self.finish_shutdown(),
        }
    }

    fn finish_shutdown(&mut self) -> Flow {
        if self.synced.is_some() {
            self.persist();
        } else {
            warn!("Device directory was unreadable, leaving it as it is");
        }

        info!("Shutdown sequence complete");
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        Flow::Stop
    }

    // --- helpers ---

    fn device(&self, id: &DeviceId) -> Option<&TrackedDevice> {
        self.devices.iter().find(|d| d.id() == id)
    }

    fn device_mut(&mut self, id: &DeviceId) -> Option<&mut TrackedDevice> {
        self.devices.iter_mut().find(|d| d.id() == id)
    }

    fn emit(&self, event: MonitorEvent) {
        let _ = self.events.send(event);
    }

    fn emit_changes(&self, changes: impl IntoIterator<Item = Change>) {
        for change in changes {
            self.emit(MonitorEvent::FieldChanged(change));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeviceField;

    fn id(s: &str) -> DeviceId {
        DeviceId::new(s).unwrap()
    }

    #[test]
    fn test_enforce_action_display() {
        assert_eq!(EnforceAction::EnableAll.to_string(), "enable-all");
        assert_eq!(EnforceAction::DisableAll.to_string(), "disable-all");
        assert_eq!(EnforceAction::DisableAll.toggle(), ToggleAction::Disable);
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config {
            poll_interval_ms: 250,
            debounce_ms: 2000,
            ..Config::default()
        };
        let settings = MonitorSettings::from_config(&config);
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.debounce, Duration::from_secs(2));
        assert_eq!(MonitorSettings::default().debounce, Duration::from_secs(5));
    }

    #[test]
    fn test_toggle_error_maps_to_monitor_error() {
        let err = ToggleError::Exec {
            action: ToggleAction::Enable,
            id: id("1-1"),
            code: Some(5),
            stderr: "Access is denied.".to_string(),
        };
        assert_eq!(
            MonitorError::from(&err),
            MonitorError::ToggleFailed {
                id: id("1-1"),
                action: ToggleAction::Enable,
                detail: "Access is denied.".to_string(),
            }
        );
    }

    #[test]
    fn test_events_serialize_tagged() {
        let event = MonitorEvent::FieldChanged(Change {
            id: id("1-1"),
            field: DeviceField::Active,
            old: true,
            new: false,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "field_changed");
        assert_eq!(json["id"], "1-1");
        assert_eq!(json["field"], "active");

        let json = serde_json::to_value(MonitorEvent::EnforcementStarted {
            action: EnforceAction::DisableAll,
        })
        .unwrap();
        assert_eq!(json["action"], "disable_all");
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_monitor() {
        let handle = {
            let (tx, _rx) = mpsc::unbounded_channel();
            let (events, _) = broadcast::channel(1);
            MonitorHandle {
                tx,
                events,
                probe: Arc::new(crate::enumerate::BlockingProbe::new(
                    crate::enumerate::UnsupportedTree,
                    crate::enumerate::IdMatch::Exact,
                )),
            }
        };
        assert_eq!(handle.policy().await, Err(MonitorError::Stopped));
    }
}
