//! Domain types for tracked USB devices.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Characters that may appear in a device instance identifier.
///
/// Windows instance paths look like `USB\VID_046D&PID_C52B\5&2A3F1B0&0&2`,
/// sysfs names like `1-1.4` or `1-1.4:1.0`. The id ends up inside an external
/// command line, so quotes and shell metacharacters are refused.
static DEVICE_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9\\&_.#{}\-:+]+$").expect("device id pattern is valid")
});

/// Errors from validating a device identifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceIdError {
    #[error("Device id is empty")]
    Empty,

    #[error("Device id contains unsupported characters: {0}")]
    InvalidCharacters(String),
}

/// Stable hardware-instance identifier (newtype for type safety).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a validated device id.
    pub fn new(value: impl Into<String>) -> Result<Self, DeviceIdError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DeviceIdError::Empty);
        }
        if !DEVICE_ID_PATTERN.is_match(trimmed) {
            return Err(DeviceIdError::InvalidCharacters(value));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Get the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = DeviceIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

/// Direction of a toggle command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToggleAction {
    Enable,
    Disable,
}

impl ToggleAction {
    /// Map a desired enabled state to an action.
    pub fn from_enabled(enable: bool) -> Self {
        if enable { Self::Enable } else { Self::Disable }
    }

    /// Whether this action leaves the device enabled.
    pub fn is_enable(self) -> bool {
        matches!(self, Self::Enable)
    }

    /// Lowercase verb (`enable` / `disable`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enable => "enable",
            Self::Disable => "disable",
        }
    }

    /// Capitalized verb, as used by the `PnpDevice` cmdlets.
    pub fn as_title(self) -> &'static str {
        match self {
            Self::Enable => "Enable",
            Self::Disable => "Disable",
        }
    }
}

impl fmt::Display for ToggleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable field of a tracked device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceField {
    Connected,
    Active,
}

/// Field-level diff produced by every mutation of a tracked device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    pub id: DeviceId,
    pub field: DeviceField,
    pub old: bool,
    pub new: bool,
}

/// A USB peripheral the user asked us to keep in line with policy.
///
/// `connected` and `active` are transient: they are re-derived from the
/// device tree after every start and are never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedDevice {
    id: DeviceId,
    name: String,
    connected: bool,
    active: bool,
}

impl TrackedDevice {
    /// Create a device in the unobserved state (disconnected, inactive).
    pub fn new(id: DeviceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            connected: false,
            active: false,
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn active(&self) -> bool {
        self.active
    }

    /// Record presence. A disconnect also drops `active`.
    pub fn set_connected(&mut self, connected: bool) -> Vec<Change> {
        let mut changes = Vec::new();
        if let Some(change) = self.update(DeviceField::Connected, connected) {
            changes.push(change);
        }
        if !connected && let Some(change) = self.update(DeviceField::Active, false) {
            changes.push(change);
        }
        changes
    }

    /// Record the enabled state. Ignored (clamped to false) while disconnected.
    pub fn set_active(&mut self, active: bool) -> Option<Change> {
        self.update(DeviceField::Active, active && self.connected)
    }

    fn update(&mut self, field: DeviceField, new: bool) -> Option<Change> {
        let slot = match field {
            DeviceField::Connected => &mut self.connected,
            DeviceField::Active => &mut self.active,
        };
        if *slot == new {
            return None;
        }
        let old = std::mem::replace(slot, new);
        Some(Change {
            id: self.id.clone(),
            field,
            old,
            new,
        })
    }
}

/// Desired-state policy for all tracked devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MonitorPolicy {
    /// Enable everything while awake, disable on sleep/resume and shutdown.
    pub auto_enforce: bool,
}
