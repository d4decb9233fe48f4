//! sysfs USB device tree backend.
//!
//! Walks `/sys/bus/usb/devices`. Instance ids are kernel device names
//! (`1-1.4`); interface entries (`1-1.4:1.0`) are skipped. The `authorized`
//! attribute is the enabled bit.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::trace;

use super::{DeviceStatus, DeviceTree, EnumerationError, IdMatch, PresentDevice};

/// Device tree rooted at a sysfs `devices` directory.
#[derive(Debug, Clone)]
pub struct SysfsTree {
    root: PathBuf,
}

impl SysfsTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Walk the present devices, returning the first one `visit` accepts.
    fn find<R>(
        &self,
        mut visit: impl FnMut(&str, &Path) -> Option<R>,
    ) -> Result<Option<R>, EnumerationError> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            EnumerationError::Unavailable(format!("{}: {}", self.root.display(), e))
        })?;

        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if is_interface(&name) {
                continue;
            }
            if let Some(found) = visit(&name, &entry.path()) {
                return Ok(Some(found));
            }
        }

        Ok(None)
    }
}

impl DeviceTree for SysfsTree {
    fn query(&self, id: &str, id_match: IdMatch) -> Result<DeviceStatus, EnumerationError> {
        let status = self.find(|name, path| {
            id_match.matches(id, name).then(|| {
                trace!("{} matched {}", id, name);
                DeviceStatus {
                    present: true,
                    enabled: read_authorized(path),
                }
            })
        })?;

        Ok(status.unwrap_or(DeviceStatus::ABSENT))
    }

    fn display_name(
        &self,
        id: &str,
        id_match: IdMatch,
    ) -> Result<Option<String>, EnumerationError> {
        let name = self.find(|name, path| id_match.matches(id, name).then(|| describe(path)))?;
        Ok(name.flatten())
    }

    fn list_usb(&self) -> Result<Vec<PresentDevice>, EnumerationError> {
        let mut devices = Vec::new();
        self.find::<()>(|name, path| {
            devices.push(PresentDevice {
                instance_id: name.to_string(),
                name: describe(path).unwrap_or_else(|| super::UNKNOWN_DEVICE_NAME.to_string()),
                enabled: read_authorized(path),
            });
            None
        })?;
        devices.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(devices)
    }
}

/// Interface nodes carry a `:config.interface` suffix.
fn is_interface(name: &str) -> bool {
    name.contains(':')
}

fn read_attr(path: &Path, attr: &str) -> Option<String> {
    fs::read_to_string(path.join(attr))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn read_authorized(path: &Path) -> bool {
    read_attr(path, "authorized").is_some_and(|v| v == "1")
}

/// Product string first, manufacturer second.
fn describe(path: &Path) -> Option<String> {
    read_attr(path, "product").or_else(|| read_attr(path, "manufacturer"))
}
