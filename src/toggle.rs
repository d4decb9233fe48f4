//! Privileged enable/disable command invocation.
//!
//! Builds the configured command line for one device and spawns it
//! asynchronously, capturing exit code, stdout and stderr.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, trace, warn};

use crate::domain::{DeviceId, ToggleAction};

/// Rate limiter for error logging.
static ERROR_LOG_COUNT: AtomicU32 = AtomicU32::new(0);
const ERROR_LOG_RATE_LIMIT: u32 = 10; // Log every Nth error after initial burst

/// Errors from a toggle command.
#[derive(Error, Debug)]
pub enum ToggleError {
    #[error("Failed to {action} device {id} (exit code {code:?}): {stderr}")]
    Exec {
        action: ToggleAction,
        id: DeviceId,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to spawn command to {action} device {id}: {source}")]
    Spawn {
        action: ToggleAction,
        id: DeviceId,
        #[source]
        source: std::io::Error,
    },
}

impl ToggleError {
    pub fn id(&self) -> &DeviceId {
        match self {
            Self::Exec { id, .. } | Self::Spawn { id, .. } => id,
        }
    }

    pub fn action(&self) -> ToggleAction {
        match self {
            Self::Exec { action, .. } | Self::Spawn { action, .. } => *action,
        }
    }

    /// Captured error text, suitable for showing to the user.
    pub fn detail(&self) -> String {
        match self {
            Self::Exec { stderr, .. } => stderr.clone(),
            Self::Spawn { source, .. } => source.to_string(),
        }
    }
}

/// Changes the OS-level enabled state of a device.
///
/// Does not touch any tracked state; callers reconcile from the result.
#[async_trait]
pub trait ToggleExecutor: Send + Sync {
    async fn set_enabled(&self, id: &DeviceId, enable: bool) -> Result<(), ToggleError>;
}

/// Default command template for the current platform.
pub fn default_command() -> Vec<String> {
    if cfg!(windows) {
        vec![
            "powershell.exe".to_string(),
            "-NoProfile".to_string(),
            "-NonInteractive".to_string(),
            "-Command".to_string(),
            "Get-PnpDevice -InstanceId '{id}' | {Action}-PnpDevice -Confirm:$false".to_string(),
        ]
    } else {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo {flag} > '{root}/{id}/authorized'".to_string(),
        ]
    }
}

/// Runs an external command per toggle.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    /// Program followed by argument templates.
    template: Vec<String>,

    /// Value of the `{root}` placeholder.
    root: String,

    /// Dry run mode.
    dry_run: bool,
}

impl CommandExecutor {
    /// Create an executor from a template; falls back to [`default_command`].
    pub fn new(template: Option<Vec<String>>, dry_run: bool) -> Self {
        let template = template
            .filter(|t| !t.is_empty())
            .unwrap_or_else(default_command);
        info!("Using toggle command: {}", template.join(" "));
        Self {
            template,
            root: crate::config::DEFAULT_SYSFS_ROOT.to_string(),
            dry_run,
        }
    }

    /// Set the device tree root substituted for `{root}`.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into().to_string_lossy().into_owned();
        self
    }

    /// Expand placeholders into program + arguments.
    fn build_command(&self, id: &DeviceId, action: ToggleAction) -> (String, Vec<String>) {
        let values = Placeholders {
            id: id.as_str(),
            action,
            root: &self.root,
        };

        let mut parts = self.template.iter().map(|part| values.expand(part));
        let program = parts.next().unwrap_or_default();
        (program, parts.collect())
    }
}

/// Values substituted into a command template.
struct Placeholders<'a> {
    id: &'a str,
    action: ToggleAction,
    root: &'a str,
}

impl Placeholders<'_> {
    fn get(&self, name: &str) -> Option<&str> {
        match name {
            "id" => Some(self.id),
            "action" => Some(self.action.as_str()),
            "Action" => Some(self.action.as_title()),
            "flag" => Some(if self.action.is_enable() { "1" } else { "0" }),
            "root" => Some(self.root),
            _ => None,
        }
    }

    /// Replace every known `{name}` in one pass. Substituted text is never
    /// rescanned and unknown names are left as written.
    fn expand(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            rest = &rest[open..];

            let known = rest
                .find('}')
                .and_then(|close| self.get(&rest[1..close]).map(|value| (value, close)));
            match known {
                Some((value, close)) => {
                    out.push_str(value);
                    rest = &rest[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = &rest[1..];
                }
            }
        }

        out.push_str(rest);
        out
    }
}

#[async_trait]
impl ToggleExecutor for CommandExecutor {
    async fn set_enabled(&self, id: &DeviceId, enable: bool) -> Result<(), ToggleError> {
        let action = ToggleAction::from_enabled(enable);
        let (program, args) = self.build_command(id, action);

        if self.dry_run {
            info!("[DRY RUN] Would execute: {} {}", program, args.join(" "));
            return Ok(());
        }

        debug!("Running {} for {}: {} {}", action, id, program, args.join(" "));

        let output = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ToggleError::Spawn {
                action,
                id: id.clone(),
                source,
            })?
            .wait_with_output()
            .await
            .map_err(|source| ToggleError::Spawn {
                action,
                id: id.clone(),
                source,
            })?;

        if output.status.success() {
            trace!(
                "{} {} succeeded: {}",
                action,
                id,
                String::from_utf8_lossy(&output.stdout).trim()
            );
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        // Rate-limit error logging
        let count = ERROR_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
        if count < 5 || count % ERROR_LOG_RATE_LIMIT == 0 {
            error!(
                "Toggle command failed to {} {} (exit code {:?}): {}",
                action,
                id,
                output.status.code(),
                stderr
            );
            if count == 5 {
                warn!(
                    "Rate-limiting error logs (showing every {}th error)",
                    ERROR_LOG_RATE_LIMIT
                );
            }
        }

        Err(ToggleError::Exec {
            action,
            id: id.clone(),
            code: output.status.code(),
            stderr,
        })
    }
}
