//! Routing through a driver-backed router
//!
//! Intercepted allocations served by the driver's stream-ordered allocator
//! count against the same device memory the engine sees.

use std::ffi::c_void;
use std::sync::Arc;
use vbar_driver::{DeviceId, DevicePtr, DriverBackend, MockDeviceConfig, MockDriver, StreamHandle};
use vbar_hooks::router::{
    self, RUNTIME_ERROR_MEMORY_ALLOCATION, RUNTIME_ERROR_NOT_SUPPORTED, RUNTIME_SUCCESS,
};
use vbar_hooks::{AllocationRouter, FreeDisposition};

struct DriverRouter(Arc<MockDriver>);

impl AllocationRouter for DriverRouter {
    fn alloc(&self, size: usize, stream: StreamHandle) -> Option<DevicePtr> {
        self.0.alloc_async(size, stream).ok()
    }

    fn free(&self, ptr: DevicePtr, stream: StreamHandle) -> FreeDisposition {
        match self.0.free_async(ptr, stream) {
            Ok(()) => FreeDisposition::Released,
            Err(_) => FreeDisposition::NotOwned,
        }
    }
}

#[test]
fn test_routed_allocations_use_device_memory() {
    let driver = Arc::new(MockDriver::new(MockDeviceConfig::with_memory(64 << 20)));
    router::set_router(Arc::new(DriverRouter(driver.clone())));

    // Not installed: nothing is routed and no original exists.
    let mut out: *mut c_void = std::ptr::null_mut();
    let status = unsafe { router::hooked_malloc_async(&mut out, 1 << 20, std::ptr::null_mut()) };
    assert_ne!(status, RUNTIME_SUCCESS);
    assert!(!router::is_active());

    router::set_active(true);

    let status = unsafe { router::hooked_malloc_async(&mut out, 8 << 20, std::ptr::null_mut()) };
    assert_eq!(status, RUNTIME_SUCCESS);
    assert!(!out.is_null());
    assert_eq!(driver.mem_info(DeviceId(0)).unwrap().used(), 8 << 20);

    let status = unsafe { router::hooked_malloc_async(&mut out, 128 << 20, std::ptr::null_mut()) };
    assert_eq!(status, RUNTIME_ERROR_MEMORY_ALLOCATION);

    // A pointer the router never handed out falls through to the original,
    // which does not exist here.
    let status = unsafe { router::hooked_free_async(0x1234 as *mut c_void, std::ptr::null_mut()) };
    assert_eq!(status, RUNTIME_ERROR_NOT_SUPPORTED);

    router::set_active(false);
    router::clear_router();
}
