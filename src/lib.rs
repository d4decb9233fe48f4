//! usb-sentry - keeps tracked USB devices in line with a sleep/wake policy.
//!
//! Tracks a user-chosen set of USB devices, polls their presence and enabled
//! state, and disables them around sleep and shutdown so they cannot wake the
//! machine or drain power while it is suspended.

pub mod config;
#[cfg(windows)]
pub mod console;
pub mod debounce;
pub mod domain;
pub mod enumerate;
pub mod monitor;
pub mod power;
pub mod privilege;
pub mod store;
pub mod toggle;
