//! Messages that should appear once per process.
//!
//! ```rust,ignore
//! static FREEING: LogOnce = LogOnce::new();
//! if FREEING.first() {
//!     tracing::warn!("host framework is freeing VRAM");
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

/// A latch that is open exactly once.
#[derive(Debug, Default)]
pub struct LogOnce(AtomicBool);

impl LogOnce {
    /// A fresh latch.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// `true` on the first call only.
    pub fn first(&self) -> bool {
        !self.0.swap(true, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_only_once() {
        let shot = LogOnce::new();
        assert!(shot.first());
        assert!(!shot.first());
        assert!(!shot.first());
    }
}
