//! Configuration loading and defaults for usb-sentry.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::enumerate::IdMatch;

/// Default location of the USB device tree on Linux.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys/bus/usb/devices";

/// Main configuration for usb-sentry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interval between device polls in milliseconds (default: 1000).
    pub poll_interval_ms: u64,

    /// Settle window before committing a presence change (default: 5000).
    pub debounce_ms: u64,

    /// Delay after a resume-from-sleep signal before enforcing (default: 1000).
    pub resume_settle_ms: u64,

    /// How tracked ids are matched against enumerated instance ids.
    pub id_match: IdMatch,

    /// Path to the tracked-device directory file.
    /// If unset, uses `<config_dir>/usb-sentry/devices.toml`.
    pub directory_path: Option<PathBuf>,

    /// Command template used to enable/disable a device.
    /// First element is the program. Placeholders: {id} {action} {Action} {flag} {root}.
    pub toggle_command: Option<Vec<String>>,

    /// Root of the USB device tree in sysfs (Linux only).
    pub sysfs_root: PathBuf,

    /// Dry run mode: log toggle commands instead of executing.
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            debounce_ms: 5000,
            resume_settle_ms: 1000,
            id_match: IdMatch::default(),
            directory_path: None,
            toggle_command: None,
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            dry_run: false,
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default path, or return defaults if not found.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            return Self::load(p);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let default_path = config_dir.join("usb-sentry").join("config.toml");
            if default_path.exists() {
                return Self::load(&default_path);
            }
        }

        Ok(Self::default())
    }

    /// Reject values the monitor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than zero");
        }
        if self.debounce_ms == 0 {
            anyhow::bail!("debounce_ms must be greater than zero");
        }
        if let Some(ref command) = self.toggle_command
            && command.first().is_none_or(|program| program.trim().is_empty())
        {
            anyhow::bail!("toggle_command must name a program");
        }
        Ok(())
    }

    /// Resolve the directory file path.
    pub fn directory_path(&self) -> Option<PathBuf> {
        self.directory_path.clone().or_else(|| {
            dirs::config_dir().map(|dir| dir.join("usb-sentry").join("devices.toml"))
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn resume_settle(&self) -> Duration {
        Duration::from_millis(self.resume_settle_ms)
    }
}
