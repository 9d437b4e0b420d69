//! Backend trait and the per-vendor implementations.
//!
//! Each backend is a pure translation layer: one trait call maps to one
//! vendor call, failures are turned into [`DriverError`](crate::DriverError)
//! and nothing is buffered or retried here.

#[cfg(feature = "cuda")]
pub mod cuda;
#[cfg(feature = "rocm")]
pub mod hip;
pub mod mock;

use crate::device::{DeviceId, DeviceInfo, MemInfo};
use crate::memory::{Access, DevicePtr, PhysHandle, StreamHandle};
use crate::DriverResult;

/// Virtual-memory primitives of a GPU driver.
///
/// Implementations must be usable from any thread. The engine serializes
/// calls per device, but the host allocator path calls `alloc_async` and
/// `free_async` concurrently with it.
pub trait DriverBackend: Send + Sync {
    /// Backend name ("CUDA", "ROCm", "Mock").
    fn name(&self) -> &'static str;

    /// Initialize the driver and make `device` current on the calling thread.
    fn init(&self, device: DeviceId) -> DriverResult<()>;

    /// Number of devices visible to the driver.
    fn device_count(&self) -> DriverResult<u32>;

    /// Describe a device.
    fn device_info(&self, device: DeviceId) -> DriverResult<DeviceInfo>;

    /// Reserve `size` bytes of device virtual address space.
    fn reserve_va(&self, size: usize, alignment: usize) -> DriverResult<DevicePtr>;

    /// Release a reservation made by [`reserve_va`](Self::reserve_va).
    fn free_va(&self, va: DevicePtr, size: usize) -> DriverResult<()>;

    /// Create a physical allocation of `size` bytes on `device`.
    fn create_physical(&self, size: usize, device: DeviceId) -> DriverResult<PhysHandle>;

    /// Release a physical allocation. It must not be mapped anywhere.
    fn release_physical(&self, handle: PhysHandle) -> DriverResult<()>;

    /// Map `handle` at `va`. `size` must equal the allocation size.
    fn map(&self, va: DevicePtr, size: usize, handle: PhysHandle) -> DriverResult<()>;

    /// Unmap `size` bytes at `va`.
    fn unmap(&self, va: DevicePtr, size: usize) -> DriverResult<()>;

    /// Grant `device` access to a mapped range.
    fn set_access(
        &self,
        va: DevicePtr,
        size: usize,
        device: DeviceId,
        access: Access,
    ) -> DriverResult<()>;

    /// Free and total memory of `device`. Leaves the calling thread's
    /// current device or context as it found it.
    fn mem_info(&self, device: DeviceId) -> DriverResult<MemInfo>;

    /// Stream-ordered allocation on the current device.
    fn alloc_async(&self, size: usize, stream: StreamHandle) -> DriverResult<DevicePtr>;

    /// Stream-ordered free.
    fn free_async(&self, ptr: DevicePtr, stream: StreamHandle) -> DriverResult<()>;

    /// Block until all work on `device` has completed. Like
    /// [`mem_info`](Self::mem_info), this does not change the current device.
    fn synchronize(&self, device: DeviceId) -> DriverResult<()>;
}
