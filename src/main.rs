//! usb-sentry - daemon that keeps tracked USB devices disabled across sleep.
//!
//! Polls the tracked devices, re-enables them while the machine is awake and
//! disables them on resume from sleep and on shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use usb_sentry::config::Config;
use usb_sentry::domain::{DeviceId, TrackedDevice};
use usb_sentry::enumerate::{BlockingProbe, DeviceProbe, DeviceTree, native_tree};
use usb_sentry::monitor::{Monitor, MonitorEvent, MonitorHandle, MonitorSettings};
use usb_sentry::power::{PowerListener, subscribe_native};
use usb_sentry::privilege::is_elevated;
use usb_sentry::store::{DirectoryEntry, DirectoryStore, TomlDirectoryStore};
use usb_sentry::toggle::{CommandExecutor, ToggleExecutor};

/// USB device sleep guard.
///
/// Keeps a set of tracked USB devices enabled while awake and disabled
/// around sleep and shutdown.
#[derive(Parser, Debug)]
#[command(name = "usb-sentry")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable dry-run mode (log toggle commands instead of running them).
    #[arg(long, global = true)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the monitor daemon (default).
    Run,

    /// List present USB devices that can be tracked.
    List,

    /// Start tracking a device.
    Add {
        /// Device instance id, as printed by `list`.
        id: String,

        /// Display name; resolved from the device tree when omitted.
        #[arg(long)]
        name: Option<String>,
    },

    /// Stop tracking a device.
    Remove {
        /// Device instance id.
        id: String,
    },

    /// Enable one tracked device now.
    Enable {
        /// Device instance id.
        id: String,
    },

    /// Disable one tracked device now.
    Disable {
        /// Device instance id.
        id: String,
    },

    /// Turn automatic enforcement on or off.
    Policy {
        #[arg(value_enum)]
        state: PolicyState,
    },

    /// Show the tracked devices and their current state.
    Status {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum PolicyState {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level)?;

    // Load config
    let mut config =
        Config::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;

    if args.dry_run {
        config.dry_run = true;
    }

    let store = TomlDirectoryStore::new(
        config
            .directory_path()
            .context("Could not determine the configuration directory")?,
    );
    debug!("Directory file: {}", store.path().display());

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config, store).await,
        Commands::List => list_devices(&config),
        Commands::Add { id, name } => add_device(&config, &store, &id, name).await,
        Commands::Remove { id } => remove_device(&store, &id),
        Commands::Enable { id } => {
            ensure_privileged(&config)?;
            toggle_device(&config, &store, &id, true).await
        }
        Commands::Disable { id } => {
            ensure_privileged(&config)?;
            toggle_device(&config, &store, &id, false).await
        }
        Commands::Policy { state } => set_policy(&store, state == PolicyState::On),
        Commands::Status { json } => print_status(&config, &store, json).await,
    }
}

/// Initialize logging with the specified level.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(format!("usb_sentry={level}"))
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

fn probe_for(config: &Config) -> BlockingProbe<impl DeviceTree> {
    BlockingProbe::new(native_tree(config), config.id_match)
}

fn executor_for(config: &Config) -> CommandExecutor {
    CommandExecutor::new(config.toggle_command.clone(), config.dry_run)
        .with_root(config.sysfs_root.clone())
}

/// Toggle commands need an elevated process unless they are only logged.
fn ensure_privileged(config: &Config) -> Result<()> {
    if config.dry_run {
        info!("Dry run: skipping privilege check");
    } else if !is_elevated() {
        error!("usb-sentry must run with administrator/root privileges to toggle devices.");
        error!("Re-run elevated, or pass --dry-run to only log toggle commands.");
        anyhow::bail!("Insufficient privileges");
    }
    Ok(())
}

/// Run the monitor until asked to stop, then run the shutdown sequence.
async fn run_daemon(config: Config, store: TomlDirectoryStore) -> Result<()> {
    info!("usb-sentry v{} starting", env!("CARGO_PKG_VERSION"));
    ensure_privileged(&config)?;

    let store = Arc::new(store);
    let cancel = CancellationToken::new();

    let monitor = Monitor::new(
        MonitorSettings::from_config(&config),
        Arc::new(probe_for(&config)),
        Arc::new(executor_for(&config)),
        Arc::clone(&store) as Arc<dyn DirectoryStore>,
        cancel.clone(),
    );
    let (handle, monitor_task) = monitor.spawn();

    tokio::spawn(log_events(handle.subscribe()));

    let (power_tx, power_rx) = mpsc::unbounded_channel();
    let _subscription = match subscribe_native(power_tx).await {
        Ok(subscription) => Some(subscription),
        Err(e) => {
            warn!("Power events unavailable, continuing poll-only: {}", e);
            handle.report_subscription_failure(e.to_string());
            None
        }
    };

    tokio::spawn(
        PowerListener::new(handle.clone(), config.resume_settle()).run(power_rx, cancel.clone()),
    );

    wait_for_shutdown(&handle, store.as_ref()).await?;

    info!("Shutting down");
    if let Err(e) = handle.shutdown().await {
        warn!("Monitor exited before shutdown completed: {}", e);
    }
    cancel.cancel();

    if let Err(e) = monitor_task.await {
        error!("Monitor task failed: {}", e);
    }
    #[cfg(windows)]
    usb_sentry::console::release();

    info!("usb-sentry stopped");
    Ok(())
}

/// Block until a termination signal; SIGHUP reloads the directory file.
#[cfg(unix)]
async fn wait_for_shutdown(handle: &MonitorHandle, store: &dyn DirectoryStore) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Received Ctrl-C");
                return Ok(());
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM");
                return Ok(());
            }
            _ = hangup.recv() => {
                info!("Received SIGHUP, reloading directory");
                match store.load() {
                    Ok(directory) => handle.reload(directory),
                    Err(e) => warn!("Failed to reload directory: {}", e),
                }
            }
        }
    }
}

/// Block until Ctrl-C, Ctrl-Break, or the console session ending. Directory
/// edits are picked up by the monitor's own poll.
#[cfg(windows)]
async fn wait_for_shutdown(_handle: &MonitorHandle, _store: &dyn DirectoryStore) -> Result<()> {
    use usb_sentry::console;

    let mut ctrl_break =
        tokio::signal::windows::ctrl_break().context("Failed to install Ctrl-Break handler")?;
    let mut session = match console::watch() {
        Ok(events) => Some(events),
        Err(e) => {
            warn!("Closing the console will skip the shutdown sequence: {}", e);
            None
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Received Ctrl-C");
        }
        _ = ctrl_break.recv() => info!("Received Ctrl-Break"),
        event = next_console_event(session.as_mut()) => {
            info!("Console session ending: {:?}", event);
        }
    }
    Ok(())
}

/// Waits forever when the console handler could not be installed.
#[cfg(windows)]
async fn next_console_event(
    session: Option<&mut mpsc::UnboundedReceiver<usb_sentry::console::ConsoleEvent>>,
) -> usb_sentry::console::ConsoleEvent {
    match session {
        Some(events) => match events.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

/// Block until Ctrl-C.
#[cfg(not(any(unix, windows)))]
async fn wait_for_shutdown(_handle: &MonitorHandle, _store: &dyn DirectoryStore) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Received Ctrl-C");
    Ok(())
}

/// Log observer events for the lifetime of the monitor.
async fn log_events(mut events: broadcast::Receiver<MonitorEvent>) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match events.recv().await {
            Ok(MonitorEvent::FieldChanged(change)) => debug!(
                "{} {:?}: {} -> {}",
                change.id, change.field, change.old, change.new
            ),
            Ok(MonitorEvent::PersistenceFailed { detail }) => {
                warn!("Directory not saved: {}", detail);
            }
            Ok(event) => debug!("{:?}", event),
            Err(RecvError::Lagged(missed)) => debug!("Event log skipped {} events", missed),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Print present USB devices.
fn list_devices(config: &Config) -> Result<()> {
    let devices = native_tree(config)
        .list_usb()
        .context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found");
        return Ok(());
    }

    for device in devices {
        println!(
            "{}\t{}\t{}",
            device.instance_id,
            device.name,
            if device.enabled { "enabled" } else { "disabled" }
        );
    }
    Ok(())
}

async fn add_device(
    config: &Config,
    store: &TomlDirectoryStore,
    id: &str,
    name: Option<String>,
) -> Result<()> {
    let id = DeviceId::new(id)?;
    let mut directory = store.load()?;

    if directory.contains(&id) {
        anyhow::bail!("Device {id} is already tracked");
    }

    let name = match name {
        Some(name) => name,
        None => probe_for(config).resolve_display_name(&id).await,
    };

    println!("Tracking {id} ({name})");
    directory.insert(DirectoryEntry { id, name });
    store.save(&directory)?;
    print_reload_hint();
    Ok(())
}

fn remove_device(store: &TomlDirectoryStore, id: &str) -> Result<()> {
    let id = DeviceId::new(id)?;
    let mut directory = store.load()?;

    if !directory.remove(&id) {
        anyhow::bail!("Device {id} is not tracked");
    }

    store.save(&directory)?;
    println!("No longer tracking {id}");
    print_reload_hint();
    Ok(())
}

fn set_policy(store: &TomlDirectoryStore, auto_enforce: bool) -> Result<()> {
    let mut directory = store.load()?;
    directory.auto_enforce = auto_enforce;
    store.save(&directory)?;

    println!("Auto-enforce {}", if auto_enforce { "on" } else { "off" });
    print_reload_hint();
    Ok(())
}

/// Toggle one tracked device outside the daemon. A running daemon adopts the
/// result on its next poll.
async fn toggle_device(
    config: &Config,
    store: &dyn DirectoryStore,
    id: &str,
    enable: bool,
) -> Result<()> {
    let id = DeviceId::new(id)?;
    if !store.load()?.contains(&id) {
        anyhow::bail!("Device {id} is not tracked");
    }

    executor_for(config).set_enabled(&id, enable).await?;
    println!("{} {id}", if enable { "Enabled" } else { "Disabled" });
    Ok(())
}

/// One-shot probe of every tracked device.
async fn print_status(config: &Config, store: &TomlDirectoryStore, json: bool) -> Result<()> {
    let directory = store.load()?;
    let probe = probe_for(config);

    let mut devices = Vec::with_capacity(directory.devices.len());
    for entry in directory.devices {
        let status = probe.query_device(&entry.id).await;
        let mut device = TrackedDevice::new(entry.id, entry.name);
        device.set_connected(status.present);
        device.set_active(status.enabled);
        devices.push(device);
    }

    if json {
        let report = serde_json::json!({
            "auto_enforce": directory.auto_enforce,
            "devices": devices,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "Auto-enforce: {}",
        if directory.auto_enforce { "on" } else { "off" }
    );
    if devices.is_empty() {
        println!("No tracked devices");
    }
    for device in &devices {
        println!(
            "{}\t{}\t{}\t{}",
            device.id(),
            device.name(),
            if device.connected() { "connected" } else { "disconnected" },
            if device.active() { "active" } else { "inactive" }
        );
    }
    Ok(())
}

fn print_reload_hint() {
    println!("A running daemon picks this up within one poll interval.");
}
