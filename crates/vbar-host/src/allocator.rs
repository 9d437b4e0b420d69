//! The host framework's allocation path.
//!
//! Host allocations are ordinary stream-ordered device allocations. The
//! only thing the allocator adds is priority: before asking the driver, it
//! evicts as many VBAR pages as the device would otherwise lack, so model
//! weights give way to activations rather than the other way round.
//!
//! ```text
//!   alloc(size)
//!     ├─ deficit = size + headroom - free      reclaim(deficit)
//!     ├─ driver.alloc_async                     ok ──► account, return
//!     ├─ reclaim(size), driver.alloc_async      ok ──► account, return
//!     └─ pressure handler, OutOfMemory
//! ```
//!
//! Usage is accounted in `host_granularity` units (2 MiB by default), which
//! is how the driver's pool rounds requests.

use crate::pressure::PressureHandler;
use crate::{HostError, HostResult};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use vbar_core::{EngineRegistry, LogOnce};
use vbar_driver::{align_up, DeviceId, DevicePtr, DriverBackend, StreamHandle};
use vbar_hooks::{AllocationRouter, FreeDisposition};

static FIRST_FREE: LogOnce = LogOnce::new();

/// Stream-ordered allocator for one device that yields to host demand by
/// evicting VBAR pages.
pub struct HostAllocator {
    registry: Arc<EngineRegistry>,
    device: DeviceId,
    live: Mutex<FxHashMap<DevicePtr, usize>>,
    usage: AtomicUsize,
    pressure: RwLock<Option<Arc<dyn PressureHandler>>>,
}

impl HostAllocator {
    /// Allocator for `device`, reclaiming through `registry`.
    #[must_use]
    pub fn new(registry: Arc<EngineRegistry>, device: DeviceId) -> Self {
        Self {
            registry,
            device,
            live: Mutex::new(FxHashMap::default()),
            usage: AtomicUsize::new(0),
            pressure: RwLock::new(None),
        }
    }

    /// Device served by this allocator.
    #[must_use]
    pub const fn device(&self) -> DeviceId {
        self.device
    }

    /// Notify `handler` when an allocation fails after reclaiming.
    pub fn set_pressure_handler(&self, handler: Arc<dyn PressureHandler>) {
        *self.pressure.write() = Some(handler);
    }

    /// Stop notifying.
    pub fn clear_pressure_handler(&self) {
        *self.pressure.write() = None;
    }

    fn driver(&self) -> &dyn DriverBackend {
        self.registry.driver().as_ref()
    }

    fn granule(&self, size: usize) -> usize {
        align_up(size, self.registry.config().host_granularity)
    }

    /// Bytes the device lacks for an allocation of `size` while keeping the
    /// configured headroom free.
    #[must_use]
    pub fn budget_deficit(&self, size: usize) -> usize {
        match self.driver().mem_info(self.device) {
            Ok(info) => {
                let wanted = size.saturating_add(self.registry.config().host_headroom);
                wanted.saturating_sub(info.free)
            }
            Err(err) => {
                tracing::debug!(device = %self.device, "memory query failed: {}", err);
                0
            }
        }
    }

    fn reclaim(&self, bytes: usize) -> usize {
        if bytes == 0 {
            return 0;
        }
        match self.registry.reclaim(self.device, bytes) {
            Ok(freed) => {
                if freed > 0 {
                    tracing::debug!(device = %self.device, freed, wanted = bytes, "reclaimed VBAR pages");
                }
                freed
            }
            Err(err) => {
                tracing::warn!(device = %self.device, "reclaim failed: {}", err);
                0
            }
        }
    }

    /// Allocate `size` bytes ordered on `stream`.
    ///
    /// A zero-byte request yields a null pointer without touching the
    /// driver.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::OutOfMemory`] if the driver refuses the request
    /// even after reclaiming, or the driver failure if it is not an
    /// out-of-memory condition.
    pub fn alloc(&self, size: usize, stream: StreamHandle) -> HostResult<DevicePtr> {
        if size == 0 {
            return Ok(DevicePtr::null());
        }
        tracing::trace!(size, stream = stream.0, "host alloc");

        self.reclaim(self.budget_deficit(size));
        let ptr = match self.driver().alloc_async(size, stream) {
            Ok(ptr) => ptr,
            Err(err) if err.is_out_of_memory() => {
                self.reclaim(size);
                match self.driver().alloc_async(size, stream) {
                    Ok(ptr) => ptr,
                    Err(err) if err.is_out_of_memory() => {
                        tracing::info!(device = %self.device, size, "host allocation failed: {}", err);
                        let handler = self.pressure.read().clone();
                        if let Some(handler) = handler {
                            handler.on_pressure(self.device, size);
                        }
                        return Err(HostError::OutOfMemory {
                            device: self.device,
                            requested: size,
                        });
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            Err(err) => return Err(err.into()),
        };

        self.live.lock().insert(ptr, size);
        self.usage.fetch_add(self.granule(size), Ordering::Relaxed);
        Ok(ptr)
    }

    /// Release `ptr`.
    ///
    /// Pointers this allocator does not know are still handed to the driver,
    /// after logging that they could not be accounted.
    ///
    /// # Errors
    ///
    /// Returns the driver failure.
    pub fn free(&self, ptr: DevicePtr, stream: StreamHandle) -> HostResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        match self.take(ptr) {
            Some(size) => self.release(ptr, size, stream),
            None => {
                tracing::error!("could not account free at {}", ptr);
                self.driver().free_async(ptr, stream)?;
                Ok(())
            }
        }
    }

    fn take(&self, ptr: DevicePtr) -> Option<usize> {
        if FIRST_FREE.first() {
            tracing::debug!("host framework is freeing VRAM");
        }
        self.live.lock().remove(&ptr)
    }

    fn release(&self, ptr: DevicePtr, size: usize, stream: StreamHandle) -> HostResult<()> {
        tracing::trace!(%ptr, size, "host free");
        self.driver().free_async(ptr, stream)?;
        self.usage.fetch_sub(self.granule(size), Ordering::Relaxed);
        Ok(())
    }

    /// Device bytes currently held by host allocations, in granules.
    #[must_use]
    pub fn total_usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }

    /// Count `bytes` of device memory mapped outside this allocator (VRAM
    /// buffers) in [`total_usage`](Self::total_usage).
    pub fn account_external(&self, bytes: usize) {
        self.usage.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Undo [`account_external`](Self::account_external).
    pub fn release_external(&self, bytes: usize) {
        let _ = self
            .usage
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(bytes)));
    }

    /// Number of outstanding host allocations.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.live.lock().len()
    }

    /// Whether `ptr` is an outstanding allocation of this allocator.
    #[must_use]
    pub fn owns(&self, ptr: DevicePtr) -> bool {
        self.live.lock().contains_key(&ptr)
    }
}

impl AllocationRouter for HostAllocator {
    fn alloc(&self, size: usize, stream: StreamHandle) -> Option<DevicePtr> {
        match HostAllocator::alloc(self, size, stream) {
            Ok(ptr) => Some(ptr),
            Err(err) => {
                tracing::debug!("intercepted allocation of {} bytes failed: {}", size, err);
                None
            }
        }
    }

    fn free(&self, ptr: DevicePtr, stream: StreamHandle) -> FreeDisposition {
        let Some(size) = self.take(ptr) else {
            return FreeDisposition::NotOwned;
        };
        if let Err(err) = self.release(ptr, size, stream) {
            tracing::error!("intercepted free of {} failed: {}", ptr, err);
        }
        FreeDisposition::Released
    }
}
