//! Device tree enumeration.
//!
//! Native backends implement [`DeviceTree`]: every call acquires its own
//! enumeration handle, walks the present-device set and releases the handle
//! before returning. The monitor only sees the async [`DeviceProbe`], which
//! runs the blocking walk off the runtime and degrades enumeration failures
//! to "not present".

#[cfg(target_os = "linux")]
mod sysfs;
#[cfg(windows)]
mod setupapi;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{trace, warn};

use crate::config::Config;
use crate::domain::DeviceId;

#[cfg(target_os = "linux")]
pub use sysfs::SysfsTree;
#[cfg(windows)]
pub use setupapi::SetupApiTree;

/// Name reported when the device tree has no description for a device.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// How a tracked id is compared with enumerated instance ids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdMatch {
    /// Case-insensitive equality with the canonical instance id (default).
    #[default]
    Exact,
    /// Tracked id contained anywhere in the instance id.
    ///
    /// Approximate: `1-1` also matches `1-1.4`. Kept for directories written
    /// against partial ids.
    Substring,
}

impl IdMatch {
    /// Whether `instance_id` identifies the tracked device `tracked`.
    pub fn matches(self, tracked: &str, instance_id: &str) -> bool {
        match self {
            Self::Exact => instance_id.eq_ignore_ascii_case(tracked),
            Self::Substring => instance_id.contains(tracked),
        }
    }
}

/// Presence and enablement of one device at sampling time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub present: bool,
    pub enabled: bool,
}

impl DeviceStatus {
    pub const ABSENT: Self = Self {
        present: false,
        enabled: false,
    };
}

/// A present USB device, as offered by the device picker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresentDevice {
    pub instance_id: String,
    pub name: String,
    pub enabled: bool,
}

/// Errors that can occur while walking the device tree.
#[derive(Error, Debug)]
pub enum EnumerationError {
    #[error("Device enumeration unavailable: {0}")]
    Unavailable(String),
}

/// Blocking access to the OS device tree.
pub trait DeviceTree: Send + Sync + 'static {
    /// Look up presence and the started bit of one device.
    fn query(&self, id: &str, id_match: IdMatch) -> Result<DeviceStatus, EnumerationError>;

    /// Description (or friendly name) of one device, if it is present.
    fn display_name(&self, id: &str, id_match: IdMatch)
    -> Result<Option<String>, EnumerationError>;

    /// All present USB devices.
    fn list_usb(&self) -> Result<Vec<PresentDevice>, EnumerationError>;
}

/// Async device queries used by the monitor.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    /// Sample a device. Never fails: unknown presence reads as absent.
    async fn query_device(&self, id: &DeviceId) -> DeviceStatus;

    /// Human-readable label, falling back to [`UNKNOWN_DEVICE_NAME`].
    async fn resolve_display_name(&self, id: &DeviceId) -> String;
}

/// Runs a [`DeviceTree`] on the blocking pool.
pub struct BlockingProbe<T> {
    tree: Arc<T>,
    id_match: IdMatch,
}

impl<T: DeviceTree> BlockingProbe<T> {
    pub fn new(tree: T, id_match: IdMatch) -> Self {
        Self {
            tree: Arc::new(tree),
            id_match,
        }
    }

    pub fn tree(&self) -> &T {
        &self.tree
    }
}

#[async_trait]
impl<T: DeviceTree> DeviceProbe for BlockingProbe<T> {
    async fn query_device(&self, id: &DeviceId) -> DeviceStatus {
        let tree = Arc::clone(&self.tree);
        let id_match = self.id_match;
        let target = id.as_str().to_string();

        let result = tokio::task::spawn_blocking(move || tree.query(&target, id_match)).await;

        match result {
            Ok(Ok(status)) => {
                trace!("Sampled {}: {:?}", id, status);
                status
            }
            Ok(Err(e)) => {
                warn!("Treating {} as absent: {}", id, e);
                DeviceStatus::ABSENT
            }
            Err(e) => {
                warn!("Enumeration task for {} failed: {}", id, e);
                DeviceStatus::ABSENT
            }
        }
    }

    async fn resolve_display_name(&self, id: &DeviceId) -> String {
        let tree = Arc::clone(&self.tree);
        let id_match = self.id_match;
        let target = id.as_str().to_string();

        let result =
            tokio::task::spawn_blocking(move || tree.display_name(&target, id_match)).await;

        match result {
            Ok(Ok(Some(name))) if !name.trim().is_empty() => name,
            Ok(Ok(_)) => UNKNOWN_DEVICE_NAME.to_string(),
            Ok(Err(e)) => {
                warn!("Could not resolve name for {}: {}", id, e);
                UNKNOWN_DEVICE_NAME.to_string()
            }
            Err(e) => {
                warn!("Name lookup task for {} failed: {}", id, e);
                UNKNOWN_DEVICE_NAME.to_string()
            }
        }
    }
}

/// Device tree for platforms without a native backend. Everything is absent.
#[derive(Debug, Default)]
pub struct UnsupportedTree;

impl DeviceTree for UnsupportedTree {
    fn query(&self, _id: &str, _id_match: IdMatch) -> Result<DeviceStatus, EnumerationError> {
        Err(EnumerationError::Unavailable(
            "no device tree backend for this platform".to_string(),
        ))
    }

    fn display_name(
        &self,
        _id: &str,
        _id_match: IdMatch,
    ) -> Result<Option<String>, EnumerationError> {
        Ok(None)
    }

    fn list_usb(&self) -> Result<Vec<PresentDevice>, EnumerationError> {
        Ok(Vec::new())
    }
}

/// Device tree for the current platform.
#[cfg(target_os = "linux")]
pub fn native_tree(config: &Config) -> SysfsTree {
    SysfsTree::new(config.sysfs_root.clone())
}

/// Device tree for the current platform.
#[cfg(windows)]
pub fn native_tree(_config: &Config) -> SetupApiTree {
    SetupApiTree
}

/// Device tree for the current platform.
#[cfg(not(any(target_os = "linux", windows)))]
pub fn native_tree(_config: &Config) -> UnsupportedTree {
    UnsupportedTree
}
