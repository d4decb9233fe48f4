//! Per-device presence debounce state machine.
//!
//! A presence sample that disagrees with the recorded state opens a settle
//! window for that device only. When the window closes the device is sampled
//! again:
//! - still disagreeing with the recorded state: commit the transition
//! - agreeing again (flicker): discard, nothing changes

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::domain::DeviceId;

/// Decision once a settle window has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceDecision {
    /// Apply the observed transition.
    Commit,
    /// Transient flicker, keep the recorded state.
    Discard,
}

/// A settle window that has not been resolved yet.
#[derive(Debug)]
struct PendingCheck {
    /// Presence seen by the sample that opened the window.
    observed: bool,
    /// When the window opened.
    opened_at: Instant,
}

/// Tracks open settle windows, at most one per device.
#[derive(Debug)]
pub struct DebounceTracker {
    pending: HashMap<DeviceId, PendingCheck>,
    window: Duration,
}

impl DebounceTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_pending(&self, id: &DeviceId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Open a window for `id`. Returns false if one is already open.
    pub fn begin(&mut self, id: &DeviceId, recorded: bool, observed: bool) -> bool {
        if self.pending.contains_key(id) {
            return false;
        }
        debug!(
            "Presence of {} changed {} -> {}, settling for {:?}",
            id, recorded, observed, self.window
        );
        self.pending.insert(
            id.clone(),
            PendingCheck {
                observed,
                opened_at: Instant::now(),
            },
        );
        true
    }

    /// Close the window for `id` with the re-sampled presence.
    ///
    /// Returns `None` when no window was open (e.g. the device was removed).
    pub fn resolve(
        &mut self,
        id: &DeviceId,
        recorded: bool,
        resampled: bool,
    ) -> Option<DebounceDecision> {
        let check = self.pending.remove(id)?;

        if resampled == recorded {
            debug!(
                "Discarding flicker on {}: saw {} then {} after {:?}",
                id,
                check.observed,
                resampled,
                check.opened_at.elapsed()
            );
            Some(DebounceDecision::Discard)
        } else {
            debug!(
                "Committing presence of {}: {} -> {} after {:?}",
                id,
                recorded,
                resampled,
                check.opened_at.elapsed()
            );
            Some(DebounceDecision::Commit)
        }
    }

    /// Drop any open window for `id`.
    pub fn forget(&mut self, id: &DeviceId) {
        self.pending.remove(id);
    }
}
