//! Routing of intercepted runtime calls.
//!
//! The `hooked_*` functions have the exact C signatures of the runtime entry
//! points they replace. While hooks are active and a router is registered,
//! allocations go to the router; everything else reaches the original
//! implementation unchanged.
//!
//! None of these functions unwind: a panicking router is reported to the
//! caller as [`RUNTIME_ERROR_UNKNOWN`].

use parking_lot::RwLock;
use std::ffi::{c_int, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vbar_driver::{DevicePtr, StreamHandle};

/// `cudaSuccess`.
pub const RUNTIME_SUCCESS: c_int = 0;
/// `cudaErrorInvalidValue`.
pub const RUNTIME_ERROR_INVALID_VALUE: c_int = 1;
/// `cudaErrorMemoryAllocation`.
pub const RUNTIME_ERROR_MEMORY_ALLOCATION: c_int = 2;
/// `cudaErrorNotSupported`.
pub const RUNTIME_ERROR_NOT_SUPPORTED: c_int = 801;
/// `cudaErrorUnknown`.
pub const RUNTIME_ERROR_UNKNOWN: c_int = 999;

/// `cudaMalloc`.
pub type MallocFn = unsafe extern "C" fn(*mut *mut c_void, usize) -> c_int;
/// `cudaFree`.
pub type FreeFn = unsafe extern "C" fn(*mut c_void) -> c_int;
/// `cudaMallocAsync`.
pub type MallocAsyncFn = unsafe extern "C" fn(*mut *mut c_void, usize, *mut c_void) -> c_int;
/// `cudaFreeAsync`.
pub type FreeAsyncFn = unsafe extern "C" fn(*mut c_void, *mut c_void) -> c_int;

/// What a router did with a pointer handed to `free`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreeDisposition {
    /// The router owned the pointer and released it.
    Released,
    /// Not the router's pointer; the original `free` must handle it.
    NotOwned,
}

/// Destination of intercepted allocations.
pub trait AllocationRouter: Send + Sync {
    /// Allocate `size` bytes ordered on `stream`, or `None` if the memory
    /// cannot be provided.
    fn alloc(&self, size: usize, stream: StreamHandle) -> Option<DevicePtr>;

    /// Release `ptr`.
    fn free(&self, ptr: DevicePtr, stream: StreamHandle) -> FreeDisposition;
}

/// Original runtime implementations captured at install time.
#[derive(Clone, Copy, Debug, Default)]
pub struct OriginalEntryPoints {
    /// `cudaMalloc`.
    pub malloc: Option<MallocFn>,
    /// `cudaFree`.
    pub free: Option<FreeFn>,
    /// `cudaMallocAsync`.
    pub malloc_async: Option<MallocAsyncFn>,
    /// `cudaFreeAsync`.
    pub free_async: Option<FreeAsyncFn>,
}

impl OriginalEntryPoints {
    const EMPTY: Self = Self {
        malloc: None,
        free: None,
        malloc_async: None,
        free_async: None,
    };

    /// Whether no entry point was captured.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.malloc.is_none()
            && self.free.is_none()
            && self.malloc_async.is_none()
            && self.free_async.is_none()
    }
}

static ROUTER: RwLock<Option<Arc<dyn AllocationRouter>>> = parking_lot::const_rwlock(None);
static ORIGINALS: RwLock<OriginalEntryPoints> = parking_lot::const_rwlock(OriginalEntryPoints::EMPTY);
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Send intercepted allocations to `router`.
pub fn set_router(router: Arc<dyn AllocationRouter>) {
    *ROUTER.write() = Some(router);
}

/// Stop routing; intercepted calls go to the originals.
pub fn clear_router() {
    *ROUTER.write() = None;
}

/// Whether an installer has activated routing.
#[must_use]
pub fn is_active() -> bool {
    ACTIVE.load(Ordering::Acquire)
}

/// Switch routing on or off. Installers do this once their hooks are in
/// place; embedders that intercept the runtime by other means call it
/// directly.
pub fn set_active(active: bool) {
    ACTIVE.store(active, Ordering::Release);
}

/// The captured originals.
#[must_use]
pub fn originals() -> OriginalEntryPoints {
    *ORIGINALS.read()
}

pub(crate) fn set_originals(originals: OriginalEntryPoints) {
    *ORIGINALS.write() = originals;
}

fn active_router() -> Option<Arc<dyn AllocationRouter>> {
    if !is_active() {
        return None;
    }
    ROUTER.read().clone()
}

fn guarded(f: impl FnOnce() -> c_int) -> c_int {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        tracing::error!("panic inside an intercepted allocation call");
        RUNTIME_ERROR_UNKNOWN
    })
}

unsafe fn route_alloc(out: *mut *mut c_void, size: usize, stream: *mut c_void) -> Option<c_int> {
    let router = active_router()?;
    let status = match router.alloc(size, StreamHandle(stream as usize)) {
        Some(ptr) => {
            *out = ptr.as_raw() as usize as *mut c_void;
            RUNTIME_SUCCESS
        }
        None => RUNTIME_ERROR_MEMORY_ALLOCATION,
    };
    Some(status)
}

fn route_free(ptr: *mut c_void, stream: *mut c_void) -> bool {
    let Some(router) = active_router() else {
        return false;
    };
    router.free(DevicePtr::from_raw(ptr as u64), StreamHandle(stream as usize))
        == FreeDisposition::Released
}

/// Replacement for `cudaMallocAsync`.
///
/// # Safety
///
/// `out` must be null or valid for a pointer-sized write.
pub unsafe extern "C" fn hooked_malloc_async(
    out: *mut *mut c_void,
    size: usize,
    stream: *mut c_void,
) -> c_int {
    if out.is_null() {
        return RUNTIME_ERROR_INVALID_VALUE;
    }
    guarded(|| {
        if let Some(status) = route_alloc(out, size, stream) {
            return status;
        }
        match originals().malloc_async {
            Some(original) => original(out, size, stream),
            None => RUNTIME_ERROR_NOT_SUPPORTED,
        }
    })
}

/// Replacement for `cudaFreeAsync`.
///
/// # Safety
///
/// `ptr` must come from an allocation entry point of this process.
pub unsafe extern "C" fn hooked_free_async(ptr: *mut c_void, stream: *mut c_void) -> c_int {
    if ptr.is_null() {
        return RUNTIME_SUCCESS;
    }
    guarded(|| {
        if route_free(ptr, stream) {
            return RUNTIME_SUCCESS;
        }
        match originals().free_async {
            Some(original) => original(ptr, stream),
            None => RUNTIME_ERROR_NOT_SUPPORTED,
        }
    })
}

/// Replacement for `cudaMalloc`. Routed allocations use the default stream.
///
/// # Safety
///
/// `out` must be null or valid for a pointer-sized write.
pub unsafe extern "C" fn hooked_malloc(out: *mut *mut c_void, size: usize) -> c_int {
    if out.is_null() {
        return RUNTIME_ERROR_INVALID_VALUE;
    }
    guarded(|| {
        if let Some(status) = route_alloc(out, size, std::ptr::null_mut()) {
            return status;
        }
        match originals().malloc {
            Some(original) => original(out, size),
            None => RUNTIME_ERROR_NOT_SUPPORTED,
        }
    })
}

/// Replacement for `cudaFree`.
///
/// # Safety
///
/// `ptr` must come from an allocation entry point of this process.
pub unsafe extern "C" fn hooked_free(ptr: *mut c_void) -> c_int {
    if ptr.is_null() {
        return RUNTIME_SUCCESS;
    }
    guarded(|| {
        if route_free(ptr, std::ptr::null_mut()) {
            return RUNTIME_SUCCESS;
        }
        match originals().free {
            Some(original) => original(ptr),
            None => RUNTIME_ERROR_NOT_SUPPORTED,
        }
    })
}

/// Serializes tests that touch the process-wide routing state.
#[cfg(test)]
pub(crate) static TEST_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingRouter {
        allocs: AtomicUsize,
        frees: AtomicUsize,
        owned: u64,
    }

    impl AllocationRouter for CountingRouter {
        fn alloc(&self, size: usize, _stream: StreamHandle) -> Option<DevicePtr> {
            self.allocs.fetch_add(1, Ordering::SeqCst);
            (size <= 1024).then(|| DevicePtr::from_raw(self.owned))
        }

        fn free(&self, ptr: DevicePtr, _stream: StreamHandle) -> FreeDisposition {
            if ptr.as_raw() == self.owned {
                self.frees.fetch_add(1, Ordering::SeqCst);
                FreeDisposition::Released
            } else {
                FreeDisposition::NotOwned
            }
        }
    }

    struct PanickingRouter;

    impl AllocationRouter for PanickingRouter {
        fn alloc(&self, _size: usize, _stream: StreamHandle) -> Option<DevicePtr> {
            panic!("router failure")
        }

        fn free(&self, _ptr: DevicePtr, _stream: StreamHandle) -> FreeDisposition {
            FreeDisposition::NotOwned
        }
    }

    static ORIGINAL_FREES: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn fake_malloc_async(out: *mut *mut c_void, _size: usize, _s: *mut c_void) -> c_int {
        *out = 0x7000 as *mut c_void;
        RUNTIME_SUCCESS
    }

    unsafe extern "C" fn fake_free_async(_ptr: *mut c_void, _s: *mut c_void) -> c_int {
        ORIGINAL_FREES.fetch_add(1, Ordering::SeqCst);
        RUNTIME_SUCCESS
    }

    fn reset() {
        clear_router();
        set_active(false);
        set_originals(OriginalEntryPoints::default());
    }

    #[test]
    fn test_routes_when_active() {
        let _guard = TEST_LOCK.lock();
        reset();
        let router = Arc::new(CountingRouter {
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            owned: 0x9000,
        });
        set_router(router.clone());
        set_active(true);

        let mut out = std::ptr::null_mut();
        let status = unsafe { hooked_malloc_async(&mut out, 512, std::ptr::null_mut()) };
        assert_eq!(status, RUNTIME_SUCCESS);
        assert_eq!(out as usize, 0x9000);
        assert_eq!(unsafe { hooked_free_async(out, std::ptr::null_mut()) }, RUNTIME_SUCCESS);
        assert_eq!(router.frees.load(Ordering::SeqCst), 1);

        let status = unsafe { hooked_malloc(&mut out, 4096) };
        assert_eq!(status, RUNTIME_ERROR_MEMORY_ALLOCATION);
        assert_eq!(router.allocs.load(Ordering::SeqCst), 2);
        reset();
    }

    #[test]
    fn test_forwards_when_inactive() {
        let _guard = TEST_LOCK.lock();
        reset();
        set_originals(OriginalEntryPoints {
            malloc_async: Some(fake_malloc_async),
            free_async: Some(fake_free_async),
            ..OriginalEntryPoints::default()
        });
        set_router(Arc::new(CountingRouter {
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            owned: 0x9000,
        }));

        let mut out = std::ptr::null_mut();
        assert_eq!(
            unsafe { hooked_malloc_async(&mut out, 64, std::ptr::null_mut()) },
            RUNTIME_SUCCESS
        );
        assert_eq!(out as usize, 0x7000);
        let before = ORIGINAL_FREES.load(Ordering::SeqCst);
        unsafe { hooked_free_async(out, std::ptr::null_mut()) };
        assert_eq!(ORIGINAL_FREES.load(Ordering::SeqCst), before + 1);
        reset();
    }

    #[test]
    fn test_unowned_free_reaches_original() {
        let _guard = TEST_LOCK.lock();
        reset();
        set_originals(OriginalEntryPoints {
            free_async: Some(fake_free_async),
            ..OriginalEntryPoints::default()
        });
        set_router(Arc::new(CountingRouter {
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            owned: 0x9000,
        }));
        set_active(true);
        let before = ORIGINAL_FREES.load(Ordering::SeqCst);
        unsafe { hooked_free_async(0x5000 as *mut c_void, std::ptr::null_mut()) };
        assert_eq!(ORIGINAL_FREES.load(Ordering::SeqCst), before + 1);
        reset();
    }

    #[test]
    fn test_missing_original_and_bad_arguments() {
        let _guard = TEST_LOCK.lock();
        reset();
        let mut out = std::ptr::null_mut();
        assert_eq!(unsafe { hooked_malloc(&mut out, 8) }, RUNTIME_ERROR_NOT_SUPPORTED);
        assert_eq!(
            unsafe { hooked_malloc(std::ptr::null_mut(), 8) },
            RUNTIME_ERROR_INVALID_VALUE
        );
        assert_eq!(unsafe { hooked_free(std::ptr::null_mut()) }, RUNTIME_SUCCESS);
        assert!(originals().is_empty());
    }

    #[test]
    fn test_router_panic_does_not_unwind() {
        let _guard = TEST_LOCK.lock();
        reset();
        set_router(Arc::new(PanickingRouter));
        set_active(true);
        let mut out = std::ptr::null_mut();
        let status = unsafe { hooked_malloc_async(&mut out, 8, std::ptr::null_mut()) };
        assert_eq!(status, RUNTIME_ERROR_UNKNOWN);
        reset();
    }
}
