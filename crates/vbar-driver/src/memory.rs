//! Device addresses, physical handles and streams.
//!
//! These are plain value types. None of them own anything: a [`DevicePtr`]
//! is an address, a [`PhysHandle`] names a physical allocation the pool owns,
//! and a [`StreamHandle`] is whatever the vendor uses for a stream.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A device virtual address.
///
/// The representation is the same for every backend (CUDA `CUdeviceptr`,
/// HIP `void*`): a 64-bit address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DevicePtr(pub(crate) u64);

impl DevicePtr {
    /// Create a null device pointer.
    #[must_use]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Check if this is a null pointer.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Get the raw address.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Wrap a raw address handed out by a driver or a caller.
    #[must_use]
    pub const fn from_raw(ptr: u64) -> Self {
        Self(ptr)
    }

    /// Offset the pointer by a number of bytes.
    #[must_use]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }

    /// Byte distance from `base` to `self`, if `self` is not below `base`.
    #[must_use]
    pub const fn offset_from(self, base: Self) -> Option<usize> {
        if self.0 >= base.0 {
            Some((self.0 - base.0) as usize)
        } else {
            None
        }
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Opaque handle to a physical allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhysHandle(pub(crate) u64);

impl PhysHandle {
    /// Get the raw vendor handle.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Wrap a raw vendor handle.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for PhysHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phys#{:x}", self.0)
    }
}

/// A vendor stream, passed through untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct StreamHandle(pub usize);

impl StreamHandle {
    /// The legacy default stream.
    #[must_use]
    pub const fn default_stream() -> Self {
        Self(0)
    }

    /// Raw stream pointer as understood by the vendor runtime.
    #[must_use]
    pub fn as_ptr(self) -> *mut std::ffi::c_void {
        self.0 as *mut std::ffi::c_void
    }
}

/// Access granted to a device on a mapped range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    /// Reads only.
    Read,
    /// Reads and writes.
    ReadWrite,
}

/// Round `size` up to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

/// Round `size` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    size & !(align - 1)
}
