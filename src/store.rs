//! Durable tracked-device directory.
//!
//! Holds the policy flag and the identities of tracked devices. Presence and
//! enablement are never written; they are re-derived after every start.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::DeviceId;

/// One persisted device identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub id: DeviceId,
    pub name: String,
}

/// Snapshot written to durable storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Directory {
    pub auto_enforce: bool,
    pub devices: Vec<DirectoryEntry>,
}

impl Directory {
    /// Whether a device with this id is already listed.
    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.iter().any(|d| &d.id == id)
    }

    /// Add a device unless its id is already listed. Returns whether it was added.
    pub fn insert(&mut self, entry: DirectoryEntry) -> bool {
        if self.contains(&entry.id) {
            return false;
        }
        self.devices.push(entry);
        true
    }

    /// Remove a device by id. Returns whether it was listed.
    pub fn remove(&mut self, id: &DeviceId) -> bool {
        let before = self.devices.len();
        self.devices.retain(|d| &d.id != id);
        self.devices.len() != before
    }
}

/// Errors from loading or saving the directory.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Directory I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse directory file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize directory: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Load/save contract for the directory. The medium is opaque to the monitor.
pub trait DirectoryStore: Send + Sync {
    fn load(&self) -> Result<Directory, StoreError>;

    fn save(&self, directory: &Directory) -> Result<(), StoreError>;

    /// Move unreadable contents out of the way before they are first
    /// overwritten.
    fn set_aside(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// TOML file-backed directory store.
#[derive(Debug, Clone)]
pub struct TomlDirectoryStore {
    path: PathBuf,
}

impl TomlDirectoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl DirectoryStore for TomlDirectoryStore {
    fn load(&self) -> Result<Directory, StoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No directory file at {}, starting empty", self.path.display());
                return Ok(Directory::default());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        toml::from_str(&content).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, directory: &Directory) -> Result<(), StoreError> {
        let content = toml::to_string_pretty(directory)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        // Write-then-rename so a crash never leaves a truncated file.
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, content).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;

        debug!(
            "Saved {} device(s) to {}",
            directory.devices.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Renames the file to `<name>.toml.bak`, replacing an older backup.
    fn set_aside(&self) -> Result<(), StoreError> {
        let backup = self.path.with_extension("toml.bak");
        match std::fs::rename(&self.path, &backup) {
            Ok(()) => {
                warn!(
                    "Moved unreadable directory file to {}",
                    backup.display()
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}

/// In-memory store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryDirectoryStore {
    directory: Mutex<Directory>,
    saves: AtomicUsize,
}

impl MemoryDirectoryStore {
    pub fn new(directory: Directory) -> Self {
        Self {
            directory: Mutex::new(directory),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of successful `save` calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Last saved (or initial) snapshot.
    pub fn snapshot(&self) -> Directory {
        self.directory
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl DirectoryStore for MemoryDirectoryStore {
    fn load(&self) -> Result<Directory, StoreError> {
        Ok(self.snapshot())
    }

    fn save(&self, directory: &Directory) -> Result<(), StoreError> {
        let mut guard = self
            .directory
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = directory.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
