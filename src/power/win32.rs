//! Suspend/resume notifications via `PowerRegisterSuspendResumeNotification`.
//!
//! The callback runs on a system thread; it only maps the broadcast type and
//! pushes into the channel.

use std::ffi::c_void;

use tokio::sync::mpsc;
use tracing::info;
use tracing::warn;
use windows::Win32::Foundation::{ERROR_SUCCESS, HANDLE};
use windows::Win32::System::Power::{
    DEVICE_NOTIFY_SUBSCRIBE_PARAMETERS, HPOWERNOTIFY, PowerRegisterSuspendResumeNotification,
    PowerUnregisterSuspendResumeNotification,
};
use windows::Win32::UI::WindowsAndMessaging::{
    DEVICE_NOTIFY_CALLBACK, PBT_APMRESUMEAUTOMATIC, PBT_APMRESUMESUSPEND, PBT_APMSUSPEND,
};

use super::{PowerEvent, SubscriptionError};

type Sender = mpsc::UnboundedSender<PowerEvent>;

/// Registered notification; unregistered on drop.
pub struct SuspendResumeRegistration {
    handle: HPOWERNOTIFY,
    /// Boxed so the address handed to the OS stays stable.
    _params: Box<DEVICE_NOTIFY_SUBSCRIBE_PARAMETERS>,
    /// Owns the sender referenced by `params.Context`.
    context: *mut Sender,
}

// SAFETY: the raw pointers are only dereferenced by the OS callback and in
// `Drop`, after the callback has been unregistered.
unsafe impl Send for SuspendResumeRegistration {}

impl SuspendResumeRegistration {
    pub fn register(tx: Sender) -> Result<Self, SubscriptionError> {
        let context = Box::into_raw(Box::new(tx));
        let params = Box::new(DEVICE_NOTIFY_SUBSCRIBE_PARAMETERS {
            Callback: Some(on_power_broadcast),
            Context: context.cast::<c_void>(),
        });

        let mut handle: *mut c_void = std::ptr::null_mut();
        let recipient = HANDLE(std::ptr::from_ref(params.as_ref()).cast_mut().cast::<c_void>());

        // SAFETY: with DEVICE_NOTIFY_CALLBACK the recipient is a pointer to
        // the subscribe parameters, which live as long as `Self`.
        let result = unsafe {
            PowerRegisterSuspendResumeNotification(DEVICE_NOTIFY_CALLBACK, recipient, &mut handle)
        };

        if result != ERROR_SUCCESS {
            // SAFETY: registration failed, so the OS holds no reference.
            drop(unsafe { Box::from_raw(context) });
            return Err(SubscriptionError::Register(format!(
                "error code {}",
                result.0
            )));
        }

        info!("Registered for suspend/resume notifications");
        Ok(Self {
            handle: HPOWERNOTIFY(handle),
            _params: params,
            context,
        })
    }
}

impl Drop for SuspendResumeRegistration {
    fn drop(&mut self) {
        // SAFETY: the handle came from a successful registration.
        let result = unsafe { PowerUnregisterSuspendResumeNotification(self.handle) };
        if result != ERROR_SUCCESS {
            warn!("Failed to unregister power notifications: {}", result.0);
            // The callback may still fire; leak the sender rather than free it.
            return;
        }
        // SAFETY: unregistered, so nothing else references the context.
        drop(unsafe { Box::from_raw(self.context) });
    }
}

/// Map a `PBT_*` broadcast type.
fn event_for(kind: u32) -> Option<PowerEvent> {
    match kind {
        PBT_APMSUSPEND => Some(PowerEvent::Suspending),
        PBT_APMRESUMEAUTOMATIC | PBT_APMRESUMESUSPEND => Some(PowerEvent::Resumed),
        _ => None,
    }
}

unsafe extern "system" fn on_power_broadcast(
    context: *const c_void,
    kind: u32,
    _setting: *const c_void,
) -> u32 {
    if let Some(event) = event_for(kind) {
        // SAFETY: `context` is the sender boxed in `register`, alive until
        // the registration is dropped.
        let tx = unsafe { &*context.cast::<Sender>() };
        let _ = tx.send(event);
    }
    ERROR_SUCCESS.0
}
