//! Suspend/resume notifications via systemd-logind `DBus` interface.
//!
//! Listens for `PrepareForSleep(b)` on the login1 manager.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;
use zbus::Connection;

use super::{PowerEvent, SubscriptionError};

/// `DBus` service, path and interface for login1.
const LOGIND_SERVICE: &str = "org.freedesktop.login1";
const LOGIND_PATH: &str = "/org/freedesktop/login1";
const MANAGER_INTERFACE: &str = "org.freedesktop.login1.Manager";
const PREPARE_FOR_SLEEP: &str = "PrepareForSleep";

/// Signal subscription; the reader task is aborted on drop.
pub struct LogindPowerSource {
    task: JoinHandle<()>,
}

impl LogindPowerSource {
    /// Subscribe to `PrepareForSleep` and forward events into `tx`.
    pub async fn subscribe(tx: mpsc::UnboundedSender<PowerEvent>) -> Result<Self, SubscriptionError> {
        let conn = Connection::system()
            .await
            .map_err(|e| SubscriptionError::Bus(e.to_string()))?;

        let proxy = zbus::Proxy::new(&conn, LOGIND_SERVICE, LOGIND_PATH, MANAGER_INTERFACE)
            .await
            .map_err(|e| SubscriptionError::Register(e.to_string()))?;

        let mut signals = proxy
            .receive_signal(PREPARE_FOR_SLEEP)
            .await
            .map_err(|e| SubscriptionError::Register(e.to_string()))?;

        info!("Subscribed to logind {}", PREPARE_FOR_SLEEP);

        let task = tokio::spawn(async move {
            while let Some(message) = signals.next().await {
                let event = match message.body().deserialize::<bool>() {
                    Ok(starting) => event_for(starting),
                    Err(e) => {
                        warn!("Ignoring malformed {} signal: {}", PREPARE_FOR_SLEEP, e);
                        continue;
                    }
                };

                debug!("logind reported {:?}", event);
                if tx.send(event).is_err() {
                    break;
                }
            }
            debug!("{} stream ended", PREPARE_FOR_SLEEP);
        });

        Ok(Self { task })
    }
}

impl Drop for LogindPowerSource {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// `PrepareForSleep(true)` precedes sleep, `false` follows wake-up.
fn event_for(starting: bool) -> PowerEvent {
    if starting {
        PowerEvent::Suspending
    } else {
        PowerEvent::Resumed
    }
}
