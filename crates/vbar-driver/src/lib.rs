//! # VBAR Driver Layer
//!
//! Vendor-neutral virtual-memory primitives used by the VBAR engine.
//!
//! ## Overview
//!
//! The engine never talks to a vendor runtime directly. Everything it needs
//! from the GPU driver is expressed by [`DriverBackend`]:
//!
//! - **Address space**: reserve and free device virtual-address ranges
//! - **Physical memory**: create and release physical allocations
//! - **Mapping**: map/unmap physical allocations into reserved ranges and
//!   grant access to a device
//! - **Queries**: free/total memory, device name, allocation granularity
//! - **Stream-ordered allocation**: the async alloc/free used by the host
//!   framework's caching allocator
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────────┐
//!        │   vbar-core (engine, page pool)      │
//!        └──────────────────┬───────────────────┘
//!                           │ Arc<dyn DriverBackend>
//!        ┌──────────────────┼───────────────────┐
//!        ▼                  ▼                   ▼
//!  ┌────────────┐    ┌────────────┐      ┌────────────┐
//!  │ CudaDriver │    │ HipDriver  │      │ MockDriver │
//!  │  (cuda)    │    │  (rocm)    │      │  (tests)   │
//!  └────────────┘    └────────────┘      └────────────┘
//! ```
//!
//! ## Features
//!
//! - `cuda`: Build the NVIDIA backend (driver API, loaded at runtime)
//! - `rocm`: Build the AMD backend (HIP, loaded at runtime)
//!
//! Exactly one vendor backend may be compiled in. With neither feature the
//! in-process [`MockDriver`] stands in for the device.
//!
//! ## Errors
//!
//! Every failure is a [`DriverError`] carrying the vendor code, the vendor
//! message and a neutral [`DriverErrorKind`]. Callers branch on the kind,
//! never on vendor numbers.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

#[cfg(all(feature = "cuda", feature = "rocm"))]
compile_error!("features `cuda` and `rocm` are mutually exclusive");

pub mod device;
pub mod memory;
pub mod runtime;

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use device::{DeviceId, DeviceInfo, DeviceKind, MemInfo};
pub use memory::{align_down, align_up, Access, DevicePtr, PhysHandle, StreamHandle};
pub use runtime::mock::{MockDeviceConfig, MockDriver, MockOp};
pub use runtime::DriverBackend;

#[cfg(feature = "cuda")]
pub use runtime::cuda::CudaDriver;
#[cfg(feature = "rocm")]
pub use runtime::hip::HipDriver;

/// Vendor-neutral classification of a driver failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DriverErrorKind {
    /// The device could not satisfy a memory request.
    OutOfMemory,
    /// An argument was rejected (bad range, bad handle, misalignment).
    InvalidValue,
    /// The operation is not supported by this device or driver.
    NotSupported,
    /// The driver was used before initialization.
    NotInitialized,
    /// The vendor library could not be loaded.
    Unavailable,
    /// Anything else.
    Other,
}

impl DriverErrorKind {
    /// Short lowercase name used in log lines.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::OutOfMemory => "out of memory",
            Self::InvalidValue => "invalid value",
            Self::NotSupported => "not supported",
            Self::NotInitialized => "not initialized",
            Self::Unavailable => "driver unavailable",
            Self::Other => "driver error",
        }
    }
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A failed driver call.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{op} failed ({kind}, code {code}): {message}")]
pub struct DriverError {
    /// Neutral classification.
    pub kind: DriverErrorKind,
    /// Raw vendor status code (0 when the failure did not come from the vendor).
    pub code: i32,
    /// Vendor-provided message.
    pub message: String,
    /// Name of the primitive that failed.
    pub op: &'static str,
}

impl DriverError {
    /// Create a new driver error.
    #[must_use]
    pub fn new(op: &'static str, kind: DriverErrorKind, code: i32, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            op,
        }
    }

    /// Shorthand for an out-of-memory failure without a vendor code.
    #[must_use]
    pub fn out_of_memory(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, DriverErrorKind::OutOfMemory, 0, message)
    }

    /// Shorthand for a rejected argument without a vendor code.
    #[must_use]
    pub fn invalid_value(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, DriverErrorKind::InvalidValue, 0, message)
    }

    /// Shorthand for a missing vendor library.
    #[must_use]
    pub fn unavailable(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, DriverErrorKind::Unavailable, 0, message)
    }

    /// Whether the driver ran out of memory.
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        self.kind == DriverErrorKind::OutOfMemory
    }
}

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Open the backend compiled into this build.
///
/// With the `cuda` or `rocm` feature the vendor library is loaded on first
/// use. Without either, a [`MockDriver`] with a single default-sized device
/// is returned so the rest of the stack stays usable.
///
/// # Errors
///
/// Returns [`DriverErrorKind::Unavailable`] if the vendor library cannot be
/// loaded.
pub fn native_driver() -> DriverResult<Arc<dyn DriverBackend>> {
    #[cfg(feature = "cuda")]
    {
        let driver = runtime::cuda::CudaDriver::load()?;
        return Ok(Arc::new(driver));
    }

    #[cfg(feature = "rocm")]
    {
        let driver = runtime::hip::HipDriver::load()?;
        return Ok(Arc::new(driver));
    }

    #[cfg(not(any(feature = "cuda", feature = "rocm")))]
    {
        tracing::warn!("no vendor backend compiled in, using the mock driver");
        Ok(Arc::new(MockDriver::new(MockDeviceConfig::default())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_op_and_code() {
        let err = DriverError::new("map", DriverErrorKind::InvalidValue, 1, "bad range");
        let text = err.to_string();
        assert!(text.contains("map"));
        assert!(text.contains("code 1"));
        assert!(text.contains("bad range"));
    }

    #[test]
    fn test_out_of_memory_classification() {
        assert!(DriverError::out_of_memory("create_physical", "budget").is_out_of_memory());
        assert!(!DriverError::invalid_value("map", "x").is_out_of_memory());
    }

    #[cfg(not(any(feature = "cuda", feature = "rocm")))]
    #[test]
    fn test_native_driver_falls_back_to_mock() {
        let driver = native_driver().unwrap();
        assert_eq!(driver.name(), "Mock");
    }
}
