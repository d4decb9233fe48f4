//! Power-event listener.
//!
//! A platform source pushes [`PowerEvent`]s into a channel; [`PowerListener`]
//! turns each resume into a resume-enforcement request on the monitor once the
//! settle window has passed. Suspend notifications are only logged.

#[cfg(target_os = "linux")]
mod logind;
#[cfg(windows)]
mod win32;

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::monitor::{EnforceOutcome, MonitorHandle};

#[cfg(target_os = "linux")]
pub use logind::LogindPowerSource;
#[cfg(windows)]
pub use win32::SuspendResumeRegistration;

/// Suspend/resume notification from the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    Suspending,
    Resumed,
}

/// Errors attaching to the OS power-event source.
#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("Failed to connect to the system bus: {0}")]
    Bus(String),

    #[error("Failed to register for suspend/resume notifications: {0}")]
    Register(String),

    #[error("No power-event source for this platform")]
    Unsupported,
}

/// Keeps a platform subscription alive. Dropping it detaches from the source.
pub struct PowerSubscription {
    _inner: Box<dyn Send>,
}

/// Attach to the platform power-event source.
#[cfg(target_os = "linux")]
pub async fn subscribe_native(
    tx: mpsc::UnboundedSender<PowerEvent>,
) -> Result<PowerSubscription, SubscriptionError> {
    let source = LogindPowerSource::subscribe(tx).await?;
    Ok(PowerSubscription {
        _inner: Box::new(source),
    })
}

/// Attach to the platform power-event source.
#[cfg(windows)]
#[allow(clippy::unused_async)]
pub async fn subscribe_native(
    tx: mpsc::UnboundedSender<PowerEvent>,
) -> Result<PowerSubscription, SubscriptionError> {
    let registration = SuspendResumeRegistration::register(tx)?;
    Ok(PowerSubscription {
        _inner: Box::new(registration),
    })
}

/// Attach to the platform power-event source.
#[cfg(not(any(target_os = "linux", windows)))]
#[allow(clippy::unused_async)]
pub async fn subscribe_native(
    _tx: mpsc::UnboundedSender<PowerEvent>,
) -> Result<PowerSubscription, SubscriptionError> {
    Err(SubscriptionError::Unsupported)
}

/// Forwards resume notifications to the monitor.
pub struct PowerListener {
    handle: MonitorHandle,
    settle: Duration,
}

impl PowerListener {
    pub fn new(handle: MonitorHandle, settle: Duration) -> Self {
        Self { handle, settle }
    }

    /// Process events until the source closes or `cancel` fires.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<PowerEvent>,
        cancel: CancellationToken,
    ) {
        info!("Power listener started (settle {:?})", self.settle);

        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Some(PowerEvent::Suspending) => info!("System is suspending"),
                Some(PowerEvent::Resumed) => {
                    info!("System resumed, settling for {:?}", self.settle);
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(self.settle) => {}
                    }

                    // Bursts of resume notifications collapse into one request.
                    while let Ok(extra) = events.try_recv() {
                        debug!("Coalescing {:?} received while settling", extra);
                    }

                    self.request_enforcement();
                }
                None => {
                    warn!("Power-event source closed");
                    break;
                }
            }
        }

        info!("Power listener stopped");
    }

    fn request_enforcement(&self) {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            match handle.request_resume_enforcement().await {
                Ok(EnforceOutcome::Completed { succeeded, failed }) => {
                    debug!(
                        "Resume enforcement done: {} succeeded, {} failed",
                        succeeded, failed
                    );
                }
                Ok(EnforceOutcome::Coalesced) => debug!("Resume enforcement coalesced"),
                Ok(EnforceOutcome::Skipped) => debug!("Resume enforcement skipped by policy"),
                Err(e) => warn!("Resume enforcement not delivered: {}", e),
            }
        });
    }
}
