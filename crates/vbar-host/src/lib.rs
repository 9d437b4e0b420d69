//! # VBAR Host Integration
//!
//! Glue between a host ML framework and the VBAR engine.
//!
//! ## Overview
//!
//! The framework's caching allocator is pointed at [`ffi::alloc_fn`] and
//! [`ffi::free_fn`]. Those feed [`HostAllocator`], which allocates through
//! the driver's stream-ordered allocator but first frees VBAR pages so the
//! framework never competes with evictable model weights for VRAM. When
//! nothing is left to reclaim, the registered [`PressureHandler`] lets the
//! framework drop its own caches.
//!
//! Model-weight ranges are handed to the framework as
//! [`ExternalBufferView`]s so they can be wrapped as tensors without a
//! copy.
//!
//! ## Lifecycle
//!
//! ```text
//!   init(device) ──► Runtime { registry, allocator, hooks }   (process slot)
//!        │
//!        ├── vbar_* C calls resolve the runtime, then the engine
//!        │
//!   cleanup() ──► hooks removed, engines shut down, slot cleared
//! ```
//!
//! Only the C ABI layer uses the process-wide slot; Rust callers can own a
//! [`Runtime`] directly.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod allocator;
pub mod ffi;
pub mod pressure;
pub mod runtime;
pub mod view;

use thiserror::Error;
use vbar_core::VbarError;
use vbar_driver::{DeviceId, DriverError};
use vbar_hooks::HookError;

pub use allocator::HostAllocator;
pub use pressure::{CallbackPressure, PressureHandler};
pub use runtime::Runtime;
pub use view::ExternalBufferView;

/// Errors produced by the host integration layer.
#[derive(Debug, Error)]
pub enum HostError {
    /// An engine operation failed.
    #[error(transparent)]
    Engine(#[from] VbarError),

    /// A driver primitive failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Allocation hooks could not be installed or removed.
    #[error("allocation hooks: {0}")]
    Hook(#[from] HookError),

    /// The device could not provide a host allocation even after reclaiming.
    #[error("out of device memory: {requested} bytes requested on {device}")]
    OutOfMemory {
        /// Device the allocation was for.
        device: DeviceId,
        /// Requested size.
        requested: usize,
    },

    /// No runtime has been initialized.
    #[error("runtime is not initialized")]
    NotInitialized,

    /// The runtime is already initialized for another device.
    #[error("runtime is already initialized for {0}")]
    AlreadyInitialized(DeviceId),

    /// A range does not fit in its buffer.
    #[error("view {offset:#x}+{length:#x} exceeds a buffer of {capacity:#x} bytes")]
    ViewOutOfBounds {
        /// Range start.
        offset: usize,
        /// Range length.
        length: usize,
        /// Buffer capacity.
        capacity: usize,
    },

    /// A C caller passed an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Result type for host operations.
pub type HostResult<T> = Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HostError::OutOfMemory {
            device: DeviceId(1),
            requested: 4096,
        };
        assert_eq!(
            err.to_string(),
            "out of device memory: 4096 bytes requested on GPU:1"
        );

        let err: HostError = VbarError::ShutDown.into();
        assert_eq!(err.to_string(), "engine has been shut down");

        let err: HostError = HookError::AlreadyInstalled.into();
        assert!(err.to_string().starts_with("allocation hooks:"));
    }
}
