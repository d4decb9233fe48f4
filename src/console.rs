//! Console close, logoff and system-shutdown notifications (Windows).
//!
//! Windows ends the process as soon as a console handler returns from one of
//! these events. The handler holds the event until [`release`] is called after
//! the shutdown sequence, bounded by [`HOLD_LIMIT`].

use std::sync::{Condvar, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use windows::Win32::Foundation::BOOL;
use windows::Win32::System::Console::{
    CTRL_CLOSE_EVENT, CTRL_LOGOFF_EVENT, CTRL_SHUTDOWN_EVENT, SetConsoleCtrlHandler,
};

/// Longest an event is held before the OS is allowed to end the process.
pub const HOLD_LIMIT: Duration = Duration::from_secs(30);

/// Console events that end the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleEvent {
    Close,
    Logoff,
    Shutdown,
}

impl ConsoleEvent {
    fn from_ctrl_type(ctrl_type: u32) -> Option<Self> {
        match ctrl_type {
            CTRL_CLOSE_EVENT => Some(Self::Close),
            CTRL_LOGOFF_EVENT => Some(Self::Logoff),
            CTRL_SHUTDOWN_EVENT => Some(Self::Shutdown),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
#[error("Failed to install console handler: {0}")]
pub struct ConsoleHookError(String);

struct Hook {
    tx: mpsc::UnboundedSender<ConsoleEvent>,
    released: Mutex<bool>,
    done: Condvar,
}

static HOOK: OnceLock<Hook> = OnceLock::new();

/// Install the process-wide handler and receive session-ending events.
/// Succeeds at most once per process.
pub fn watch() -> Result<mpsc::UnboundedReceiver<ConsoleEvent>, ConsoleHookError> {
    let (tx, rx) = mpsc::unbounded_channel();
    HOOK.set(Hook {
        tx,
        released: Mutex::new(false),
        done: Condvar::new(),
    })
    .map_err(|_| ConsoleHookError("already installed".to_string()))?;

    // SAFETY: the handler only touches the static hook, which lives for the
    // rest of the process.
    unsafe { SetConsoleCtrlHandler(Some(on_console_event), true) }
        .map_err(|e| ConsoleHookError(e.to_string()))?;

    info!("Watching for console session events");
    Ok(rx)
}

/// Let a held console event return so the OS can end the process.
pub fn release() {
    if let Some(hook) = HOOK.get() {
        *hook.released.lock().unwrap_or_else(PoisonError::into_inner) = true;
        hook.done.notify_all();
    }
}

/// Runs on a thread the OS creates for the event.
unsafe extern "system" fn on_console_event(ctrl_type: u32) -> BOOL {
    let (Some(event), Some(hook)) = (ConsoleEvent::from_ctrl_type(ctrl_type), HOOK.get()) else {
        // Ctrl-C and Ctrl-Break fall through to the next handler.
        return false.into();
    };
    if hook.tx.send(event).is_err() {
        return false.into();
    }

    let released = hook.released.lock().unwrap_or_else(PoisonError::into_inner);
    let (_released, wait) = hook
        .done
        .wait_timeout_while(released, HOLD_LIMIT, |released| !*released)
        .unwrap_or_else(PoisonError::into_inner);
    if wait.timed_out() {
        warn!("Shutdown sequence still running after {:?}", HOLD_LIMIT);
    }
    true.into()
}
