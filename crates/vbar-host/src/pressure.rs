//! Memory-pressure notification.
//!
//! When a host allocation fails even after every evictable VBAR page has
//! been reclaimed, the framework is told so it can stop routing through
//! the managed pool and drop its own caches.

use vbar_core::LogOnce;
use vbar_driver::DeviceId;

static FIRST_PRESSURE: LogOnce = LogOnce::new();

/// Receiver of "nothing left to reclaim" notifications.
pub trait PressureHandler: Send + Sync {
    /// An allocation of `requested` bytes on `device` could not be served.
    fn on_pressure(&self, device: DeviceId, requested: usize);
}

impl<F> PressureHandler for F
where
    F: Fn(DeviceId, usize) + Send + Sync,
{
    fn on_pressure(&self, device: DeviceId, requested: usize) {
        self(device, requested);
    }
}

/// A no-argument C callback, as registered through `set_empty_cache`.
#[derive(Clone, Copy, Debug)]
pub struct CallbackPressure {
    callback: extern "C" fn(),
}

impl CallbackPressure {
    /// Wrap `callback`.
    #[must_use]
    pub const fn new(callback: extern "C" fn()) -> Self {
        Self { callback }
    }
}

impl PressureHandler for CallbackPressure {
    fn on_pressure(&self, device: DeviceId, requested: usize) {
        if FIRST_PRESSURE.first() {
            tracing::warn!(
                %device,
                requested,
                "device memory exhausted, asking the host framework to release its cache"
            );
        }
        (self.callback)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn count_call() {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_c_callback_runs_every_time() {
        let handler = CallbackPressure::new(count_call);
        let before = CALLS.load(Ordering::SeqCst);
        handler.on_pressure(DeviceId(0), 1 << 20);
        handler.on_pressure(DeviceId(0), 2 << 20);
        assert_eq!(CALLS.load(Ordering::SeqCst), before + 2);
    }

    #[test]
    fn test_closure_handler() {
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&seen);
        let handler = move |_device: DeviceId, requested: usize| {
            sink.store(requested, Ordering::SeqCst);
        };
        handler.on_pressure(DeviceId(2), 77);
        assert_eq!(seen.load(Ordering::SeqCst), 77);
    }
}
