//! Serialization primitives for toggle commands.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::domain::DeviceId;

/// Single in-flight flag for enforcement passes.
#[derive(Debug, Clone, Default)]
pub struct EnforcementGuard {
    in_flight: Arc<AtomicBool>,
}

impl EnforcementGuard {
    /// Test-and-set. `None` when a pass is already running.
    pub fn try_acquire(&self) -> Option<EnforcementToken> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| EnforcementToken {
                in_flight: Arc::clone(&self.in_flight),
            })
    }

    pub fn is_held(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Releases the enforcement flag when dropped.
#[derive(Debug)]
pub struct EnforcementToken {
    in_flight: Arc<AtomicBool>,
}

impl Drop for EnforcementToken {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

/// One async lock per device id, so toggles for a device never overlap.
#[derive(Debug, Clone, Default)]
pub struct DeviceLocks {
    locks: Arc<Mutex<HashMap<DeviceId, Arc<AsyncMutex<()>>>>>,
}

impl DeviceLocks {
    /// Wait until no other toggle for `id` is outstanding.
    pub async fn acquire(&self, id: &DeviceId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(id.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the lock for a removed device unless someone still holds it.
    pub fn forget(&self, id: &DeviceId) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(id);
        }
    }
}
