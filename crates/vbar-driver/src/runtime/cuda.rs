//! CUDA driver API backend.
//!
//! The driver library is loaded at runtime with `libloading`, so the crate
//! compiles and links without CUDA installed. Only the virtual-memory
//! management subset of the driver API is bound (`cuMemAddressReserve`,
//! `cuMemCreate`, `cuMemMap`, ...), plus the stream-ordered allocator used
//! by the host framework path.
//!
//! # Error Handling
//!
//! Every non-zero `CUresult` becomes a [`DriverError`] whose message comes
//! from `cuGetErrorString` and whose kind is classified from the code.

#![allow(non_snake_case)]

use super::DriverBackend;
use crate::device::{DeviceId, DeviceInfo, DeviceKind, MemInfo};
use crate::memory::{Access, DevicePtr, PhysHandle, StreamHandle};
use crate::{DriverError, DriverErrorKind, DriverResult};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::ffi::{c_char, c_int, c_uint, c_ulonglong, c_void, CStr};
use std::sync::OnceLock;

// ============================================================================
// CUDA Types
// ============================================================================

/// CUDA result type (error code).
type CUresult = c_int;

/// CUDA device handle.
type CUdevice = c_int;

/// CUDA context handle.
type CUcontext = *mut c_void;

/// CUDA stream handle.
type CUstream = *mut c_void;

/// CUDA device pointer.
type CUdeviceptr = u64;

/// Generic physical allocation handle.
type CUmemGenericAllocationHandle = c_ulonglong;

const CUDA_SUCCESS: CUresult = 0;
const CUDA_ERROR_INVALID_VALUE: CUresult = 1;
const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;
const CUDA_ERROR_NOT_INITIALIZED: CUresult = 3;
const CUDA_ERROR_NOT_SUPPORTED: CUresult = 801;

const CU_MEM_ALLOCATION_TYPE_PINNED: c_uint = 1;
const CU_MEM_HANDLE_TYPE_NONE: c_uint = 0;
const CU_MEM_LOCATION_TYPE_DEVICE: c_uint = 1;
const CU_MEM_ACCESS_FLAGS_PROT_READ: c_uint = 1;
const CU_MEM_ACCESS_FLAGS_PROT_READWRITE: c_uint = 3;
const CU_MEM_ALLOC_GRANULARITY_MINIMUM: c_uint = 0;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CUmemLocation {
    type_: c_uint,
    id: c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CUmemAllocFlags {
    compressionType: u8,
    gpuDirectRDMACapable: u8,
    usage: u16,
    reserved: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct CUmemAllocationProp {
    type_: c_uint,
    requestedHandleTypes: c_uint,
    location: CUmemLocation,
    win32HandleMetaData: *mut c_void,
    allocFlags: CUmemAllocFlags,
}

impl CUmemAllocationProp {
    fn pinned_on(device: CUdevice) -> Self {
        Self {
            type_: CU_MEM_ALLOCATION_TYPE_PINNED,
            requestedHandleTypes: CU_MEM_HANDLE_TYPE_NONE,
            location: CUmemLocation {
                type_: CU_MEM_LOCATION_TYPE_DEVICE,
                id: device,
            },
            win32HandleMetaData: std::ptr::null_mut(),
            allocFlags: CUmemAllocFlags::default(),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct CUmemAccessDesc {
    location: CUmemLocation,
    flags: c_uint,
}

// ============================================================================
// CUDA Function Signatures
// ============================================================================

type FnCuInit = unsafe extern "C" fn(flags: c_uint) -> CUresult;
type FnCuDeviceGetCount = unsafe extern "C" fn(count: *mut c_int) -> CUresult;
type FnCuDeviceGet = unsafe extern "C" fn(device: *mut CUdevice, ordinal: c_int) -> CUresult;
type FnCuDeviceGetName =
    unsafe extern "C" fn(name: *mut c_char, len: c_int, dev: CUdevice) -> CUresult;
type FnCuDeviceTotalMem = unsafe extern "C" fn(bytes: *mut usize, dev: CUdevice) -> CUresult;
type FnCuDevicePrimaryCtxRetain =
    unsafe extern "C" fn(pctx: *mut CUcontext, dev: CUdevice) -> CUresult;
type FnCuDevicePrimaryCtxRelease = unsafe extern "C" fn(dev: CUdevice) -> CUresult;
type FnCuCtxSetCurrent = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type FnCuCtxPushCurrent = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type FnCuCtxPopCurrent = unsafe extern "C" fn(pctx: *mut CUcontext) -> CUresult;
type FnCuCtxSynchronize = unsafe extern "C" fn() -> CUresult;
type FnCuMemGetInfo = unsafe extern "C" fn(free: *mut usize, total: *mut usize) -> CUresult;
type FnCuMemAddressReserve = unsafe extern "C" fn(
    ptr: *mut CUdeviceptr,
    size: usize,
    alignment: usize,
    addr: CUdeviceptr,
    flags: c_ulonglong,
) -> CUresult;
type FnCuMemAddressFree = unsafe extern "C" fn(ptr: CUdeviceptr, size: usize) -> CUresult;
type FnCuMemCreate = unsafe extern "C" fn(
    handle: *mut CUmemGenericAllocationHandle,
    size: usize,
    prop: *const CUmemAllocationProp,
    flags: c_ulonglong,
) -> CUresult;
type FnCuMemRelease = unsafe extern "C" fn(handle: CUmemGenericAllocationHandle) -> CUresult;
type FnCuMemMap = unsafe extern "C" fn(
    ptr: CUdeviceptr,
    size: usize,
    offset: usize,
    handle: CUmemGenericAllocationHandle,
    flags: c_ulonglong,
) -> CUresult;
type FnCuMemUnmap = unsafe extern "C" fn(ptr: CUdeviceptr, size: usize) -> CUresult;
type FnCuMemSetAccess = unsafe extern "C" fn(
    ptr: CUdeviceptr,
    size: usize,
    desc: *const CUmemAccessDesc,
    count: usize,
) -> CUresult;
type FnCuMemGetAllocationGranularity = unsafe extern "C" fn(
    granularity: *mut usize,
    prop: *const CUmemAllocationProp,
    option: c_uint,
) -> CUresult;
type FnCuMemAllocAsync =
    unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize, stream: CUstream) -> CUresult;
type FnCuMemFreeAsync = unsafe extern "C" fn(dptr: CUdeviceptr, stream: CUstream) -> CUresult;
type FnCuGetErrorString =
    unsafe extern "C" fn(error: CUresult, pStr: *mut *const c_char) -> CUresult;

// ============================================================================
// Dynamic Library Loading
// ============================================================================

/// CUDA API function pointers loaded dynamically.
struct CudaApi {
    cuInit: FnCuInit,
    cuDeviceGetCount: FnCuDeviceGetCount,
    cuDeviceGet: FnCuDeviceGet,
    cuDeviceGetName: FnCuDeviceGetName,
    cuDeviceTotalMem: FnCuDeviceTotalMem,
    cuDevicePrimaryCtxRetain: FnCuDevicePrimaryCtxRetain,
    cuDevicePrimaryCtxRelease: FnCuDevicePrimaryCtxRelease,
    cuCtxSetCurrent: FnCuCtxSetCurrent,
    cuCtxPushCurrent: FnCuCtxPushCurrent,
    cuCtxPopCurrent: FnCuCtxPopCurrent,
    cuCtxSynchronize: FnCuCtxSynchronize,
    cuMemGetInfo: FnCuMemGetInfo,
    cuMemAddressReserve: FnCuMemAddressReserve,
    cuMemAddressFree: FnCuMemAddressFree,
    cuMemCreate: FnCuMemCreate,
    cuMemRelease: FnCuMemRelease,
    cuMemMap: FnCuMemMap,
    cuMemUnmap: FnCuMemUnmap,
    cuMemSetAccess: FnCuMemSetAccess,
    cuMemGetAllocationGranularity: FnCuMemGetAllocationGranularity,
    cuMemAllocAsync: FnCuMemAllocAsync,
    cuMemFreeAsync: FnCuMemFreeAsync,
    cuGetErrorString: FnCuGetErrorString,
}

/// Global CUDA API instance, loaded once.
static CUDA_API: OnceLock<Option<CudaApi>> = OnceLock::new();

fn load_cuda_api() -> Option<CudaApi> {
    #[cfg(target_os = "linux")]
    let lib_names = ["libcuda.so.1", "libcuda.so"];

    #[cfg(target_os = "windows")]
    let lib_names = ["nvcuda.dll"];

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    let lib_names: [&str; 0] = [];

    lib_names.into_iter().find_map(try_load_cuda_from)
}

fn try_load_cuda_from(lib_name: &str) -> Option<CudaApi> {
    tracing::debug!("attempting to load CUDA from: {}", lib_name);

    // Safety: symbols come from the CUDA driver library, whose ABI is stable;
    // the signatures above match the published headers.
    unsafe {
        let lib = libloading::Library::new(lib_name).ok()?;

        let api = CudaApi {
            cuInit: *lib.get::<FnCuInit>(b"cuInit").ok()?,
            cuDeviceGetCount: *lib.get::<FnCuDeviceGetCount>(b"cuDeviceGetCount").ok()?,
            cuDeviceGet: *lib.get::<FnCuDeviceGet>(b"cuDeviceGet").ok()?,
            cuDeviceGetName: *lib.get::<FnCuDeviceGetName>(b"cuDeviceGetName").ok()?,
            cuDeviceTotalMem: *lib.get::<FnCuDeviceTotalMem>(b"cuDeviceTotalMem_v2").ok()?,
            cuDevicePrimaryCtxRetain: *lib
                .get::<FnCuDevicePrimaryCtxRetain>(b"cuDevicePrimaryCtxRetain")
                .ok()?,
            cuDevicePrimaryCtxRelease: *lib
                .get::<FnCuDevicePrimaryCtxRelease>(b"cuDevicePrimaryCtxRelease_v2")
                .ok()?,
            cuCtxSetCurrent: *lib.get::<FnCuCtxSetCurrent>(b"cuCtxSetCurrent").ok()?,
            cuCtxPushCurrent: *lib.get::<FnCuCtxPushCurrent>(b"cuCtxPushCurrent_v2").ok()?,
            cuCtxPopCurrent: *lib.get::<FnCuCtxPopCurrent>(b"cuCtxPopCurrent_v2").ok()?,
            cuCtxSynchronize: *lib.get::<FnCuCtxSynchronize>(b"cuCtxSynchronize").ok()?,
            cuMemGetInfo: *lib.get::<FnCuMemGetInfo>(b"cuMemGetInfo_v2").ok()?,
            cuMemAddressReserve: *lib
                .get::<FnCuMemAddressReserve>(b"cuMemAddressReserve")
                .ok()?,
            cuMemAddressFree: *lib.get::<FnCuMemAddressFree>(b"cuMemAddressFree").ok()?,
            cuMemCreate: *lib.get::<FnCuMemCreate>(b"cuMemCreate").ok()?,
            cuMemRelease: *lib.get::<FnCuMemRelease>(b"cuMemRelease").ok()?,
            cuMemMap: *lib.get::<FnCuMemMap>(b"cuMemMap").ok()?,
            cuMemUnmap: *lib.get::<FnCuMemUnmap>(b"cuMemUnmap").ok()?,
            cuMemSetAccess: *lib.get::<FnCuMemSetAccess>(b"cuMemSetAccess").ok()?,
            cuMemGetAllocationGranularity: *lib
                .get::<FnCuMemGetAllocationGranularity>(b"cuMemGetAllocationGranularity")
                .ok()?,
            cuMemAllocAsync: *lib.get::<FnCuMemAllocAsync>(b"cuMemAllocAsync").ok()?,
            cuMemFreeAsync: *lib.get::<FnCuMemFreeAsync>(b"cuMemFreeAsync").ok()?,
            cuGetErrorString: *lib.get::<FnCuGetErrorString>(b"cuGetErrorString").ok()?,
        };

        // Keep the library loaded for the lifetime of the process.
        std::mem::forget(lib);

        tracing::info!("loaded CUDA driver library: {}", lib_name);
        Some(api)
    }
}

fn get_cuda_api() -> Option<&'static CudaApi> {
    CUDA_API.get_or_init(load_cuda_api).as_ref()
}

fn classify(result: CUresult) -> DriverErrorKind {
    match result {
        CUDA_ERROR_OUT_OF_MEMORY => DriverErrorKind::OutOfMemory,
        CUDA_ERROR_INVALID_VALUE => DriverErrorKind::InvalidValue,
        CUDA_ERROR_NOT_INITIALIZED => DriverErrorKind::NotInitialized,
        CUDA_ERROR_NOT_SUPPORTED => DriverErrorKind::NotSupported,
        _ => DriverErrorKind::Other,
    }
}

fn cuda_error(result: CUresult, op: &'static str) -> DriverError {
    if let Some(api) = get_cuda_api() {
        let mut error_str: *const c_char = std::ptr::null();
        // Safety: cuGetErrorString writes a pointer to a static string or null.
        unsafe {
            (api.cuGetErrorString)(result, &mut error_str);
            if !error_str.is_null() {
                let msg = CStr::from_ptr(error_str).to_string_lossy().into_owned();
                return DriverError::new(op, classify(result), result, msg);
            }
        }
    }
    DriverError::new(op, classify(result), result, format!("error code {result}"))
}

fn check_cuda(result: CUresult, op: &'static str) -> DriverResult<()> {
    if result == CUDA_SUCCESS {
        Ok(())
    } else {
        let err = cuda_error(result, op);
        tracing::error!(code = result, "{}", err);
        Err(err)
    }
}

fn cu_device(device: DeviceId) -> DriverResult<CUdevice> {
    CUdevice::try_from(device.0)
        .map_err(|_| DriverError::invalid_value("device", format!("bad ordinal {device}")))
}

/// CUDA implementation of [`DriverBackend`].
///
/// The primary context of each device is retained once, on first use, and
/// released when the driver is dropped. Per-device queries push that
/// context for the duration of the call and pop it again, so the caller's
/// current context is left as it was.
pub struct CudaDriver {
    api: &'static CudaApi,
    /// Retained primary contexts by device ordinal, stored as addresses.
    contexts: Mutex<FxHashMap<CUdevice, usize>>,
}

impl CudaDriver {
    /// Load the driver library and call `cuInit`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverErrorKind::Unavailable`] if no CUDA driver library is
    /// installed, or the `cuInit` failure.
    pub fn load() -> DriverResult<Self> {
        let api = get_cuda_api()
            .ok_or_else(|| DriverError::unavailable("load", "CUDA driver not available"))?;
        // Safety: cuInit takes no pointers.
        unsafe {
            check_cuda((api.cuInit)(0), "cuInit")?;
        }
        Ok(Self {
            api,
            contexts: Mutex::new(FxHashMap::default()),
        })
    }

    /// Check if CUDA is available on this system.
    #[must_use]
    pub fn is_available() -> bool {
        get_cuda_api().is_some()
    }

    /// Primary context of `device`, retained on the first request only.
    fn primary_context(&self, device: DeviceId) -> DriverResult<CUcontext> {
        let ordinal = cu_device(device)?;
        let mut contexts = self.contexts.lock();
        if let Some(&ctx) = contexts.get(&ordinal) {
            return Ok(ctx as CUcontext);
        }
        let mut dev: CUdevice = 0;
        let mut ctx: CUcontext = std::ptr::null_mut();
        // Safety: out-pointers are valid locals.
        unsafe {
            check_cuda((self.api.cuDeviceGet)(&mut dev, ordinal), "cuDeviceGet")?;
            check_cuda(
                (self.api.cuDevicePrimaryCtxRetain)(&mut ctx, dev),
                "cuDevicePrimaryCtxRetain",
            )?;
        }
        contexts.insert(ordinal, ctx as usize);
        tracing::debug!(%device, "retained primary context");
        Ok(ctx)
    }

    /// Run `f` with the primary context of `device` pushed on the calling
    /// thread, then pop it.
    fn scoped<T>(&self, device: DeviceId, f: impl FnOnce() -> DriverResult<T>) -> DriverResult<T> {
        let ctx = self.primary_context(device)?;
        // Safety: ctx is a retained primary context.
        unsafe {
            check_cuda((self.api.cuCtxPushCurrent)(ctx), "cuCtxPushCurrent")?;
        }
        let result = f();
        let mut popped: CUcontext = std::ptr::null_mut();
        // Safety: out-pointer is a valid local; the push above succeeded.
        let pop = unsafe { check_cuda((self.api.cuCtxPopCurrent)(&mut popped), "cuCtxPopCurrent") };
        let value = result?;
        pop?;
        Ok(value)
    }

    /// Devices whose primary context this driver holds.
    #[must_use]
    pub fn retained_contexts(&self) -> usize {
        self.contexts.lock().len()
    }

    fn granularity(&self, device: CUdevice) -> DriverResult<usize> {
        let prop = CUmemAllocationProp::pinned_on(device);
        let mut granularity = 0usize;
        // Safety: both pointers are valid for the duration of the call.
        unsafe {
            check_cuda(
                (self.api.cuMemGetAllocationGranularity)(
                    &mut granularity,
                    &prop,
                    CU_MEM_ALLOC_GRANULARITY_MINIMUM,
                ),
                "cuMemGetAllocationGranularity",
            )?;
        }
        Ok(granularity)
    }
}

impl DriverBackend for CudaDriver {
    fn name(&self) -> &'static str {
        "CUDA"
    }

    fn init(&self, device: DeviceId) -> DriverResult<()> {
        let ctx = self.primary_context(device)?;
        // Safety: ctx is a retained primary context.
        unsafe { check_cuda((self.api.cuCtxSetCurrent)(ctx), "cuCtxSetCurrent") }
    }

    fn device_count(&self) -> DriverResult<u32> {
        let mut count: c_int = 0;
        // Safety: out-pointer is a valid local.
        unsafe {
            check_cuda((self.api.cuDeviceGetCount)(&mut count), "cuDeviceGetCount")?;
        }
        Ok(u32::try_from(count).unwrap_or(0))
    }

    fn device_info(&self, device: DeviceId) -> DriverResult<DeviceInfo> {
        let mut dev: CUdevice = 0;
        let mut name_buf = [0 as c_char; 256];
        let mut total = 0usize;
        // Safety: buffers are sized as passed.
        let name = unsafe {
            check_cuda((self.api.cuDeviceGet)(&mut dev, cu_device(device)?), "cuDeviceGet")?;
            check_cuda(
                (self.api.cuDeviceGetName)(name_buf.as_mut_ptr(), 256, dev),
                "cuDeviceGetName",
            )?;
            check_cuda((self.api.cuDeviceTotalMem)(&mut total, dev), "cuDeviceTotalMem")?;
            CStr::from_ptr(name_buf.as_ptr())
                .to_string_lossy()
                .into_owned()
        };
        Ok(DeviceInfo {
            id: device,
            kind: DeviceKind::Cuda,
            name,
            memory_total: total,
            allocation_granularity: self.granularity(dev)?,
        })
    }

    fn reserve_va(&self, size: usize, alignment: usize) -> DriverResult<DevicePtr> {
        let mut ptr: CUdeviceptr = 0;
        // Safety: out-pointer is a valid local.
        unsafe {
            check_cuda(
                (self.api.cuMemAddressReserve)(&mut ptr, size, alignment, 0, 0),
                "cuMemAddressReserve",
            )?;
        }
        Ok(DevicePtr(ptr))
    }

    fn free_va(&self, va: DevicePtr, size: usize) -> DriverResult<()> {
        // Safety: plain values.
        unsafe { check_cuda((self.api.cuMemAddressFree)(va.0, size), "cuMemAddressFree") }
    }

    fn create_physical(&self, size: usize, device: DeviceId) -> DriverResult<PhysHandle> {
        let prop = CUmemAllocationProp::pinned_on(cu_device(device)?);
        let mut handle: CUmemGenericAllocationHandle = 0;
        // Safety: out-pointer and prop are valid locals.
        unsafe {
            check_cuda(
                (self.api.cuMemCreate)(&mut handle, size, &prop, 0),
                "cuMemCreate",
            )?;
        }
        Ok(PhysHandle(handle))
    }

    fn release_physical(&self, handle: PhysHandle) -> DriverResult<()> {
        // Safety: plain values.
        unsafe { check_cuda((self.api.cuMemRelease)(handle.0), "cuMemRelease") }
    }

    fn map(&self, va: DevicePtr, size: usize, handle: PhysHandle) -> DriverResult<()> {
        // Safety: plain values.
        unsafe { check_cuda((self.api.cuMemMap)(va.0, size, 0, handle.0, 0), "cuMemMap") }
    }

    fn unmap(&self, va: DevicePtr, size: usize) -> DriverResult<()> {
        // Safety: plain values.
        unsafe { check_cuda((self.api.cuMemUnmap)(va.0, size), "cuMemUnmap") }
    }

    fn set_access(
        &self,
        va: DevicePtr,
        size: usize,
        device: DeviceId,
        access: Access,
    ) -> DriverResult<()> {
        let desc = CUmemAccessDesc {
            location: CUmemLocation {
                type_: CU_MEM_LOCATION_TYPE_DEVICE,
                id: cu_device(device)?,
            },
            flags: match access {
                Access::Read => CU_MEM_ACCESS_FLAGS_PROT_READ,
                Access::ReadWrite => CU_MEM_ACCESS_FLAGS_PROT_READWRITE,
            },
        };
        // Safety: desc is a valid local, count matches.
        unsafe {
            check_cuda(
                (self.api.cuMemSetAccess)(va.0, size, &desc, 1),
                "cuMemSetAccess",
            )
        }
    }

    fn mem_info(&self, device: DeviceId) -> DriverResult<MemInfo> {
        self.scoped(device, || {
            let mut free = 0usize;
            let mut total = 0usize;
            // Safety: out-pointers are valid locals.
            unsafe {
                check_cuda((self.api.cuMemGetInfo)(&mut free, &mut total), "cuMemGetInfo")?;
            }
            Ok(MemInfo { free, total })
        })
    }

    fn alloc_async(&self, size: usize, stream: StreamHandle) -> DriverResult<DevicePtr> {
        let mut ptr: CUdeviceptr = 0;
        // Safety: out-pointer is a valid local; the stream is the caller's.
        unsafe {
            check_cuda(
                (self.api.cuMemAllocAsync)(&mut ptr, size, stream.as_ptr()),
                "cuMemAllocAsync",
            )?;
        }
        Ok(DevicePtr(ptr))
    }

    fn free_async(&self, ptr: DevicePtr, stream: StreamHandle) -> DriverResult<()> {
        // Safety: plain values.
        unsafe {
            check_cuda(
                (self.api.cuMemFreeAsync)(ptr.0, stream.as_ptr()),
                "cuMemFreeAsync",
            )
        }
    }

    fn synchronize(&self, device: DeviceId) -> DriverResult<()> {
        self.scoped(device, || {
            // Safety: no arguments.
            unsafe { check_cuda((self.api.cuCtxSynchronize)(), "cuCtxSynchronize") }
        })
    }
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        for (dev, _) in self.contexts.get_mut().drain() {
            // Safety: each entry holds exactly one retain on `dev`.
            let result = unsafe { (self.api.cuDevicePrimaryCtxRelease)(dev) };
            if result != CUDA_SUCCESS {
                tracing::warn!(device = dev, code = result, "primary context release failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_codes() {
        assert_eq!(classify(CUDA_ERROR_OUT_OF_MEMORY), DriverErrorKind::OutOfMemory);
        assert_eq!(classify(CUDA_ERROR_INVALID_VALUE), DriverErrorKind::InvalidValue);
        assert_eq!(classify(CUDA_ERROR_NOT_SUPPORTED), DriverErrorKind::NotSupported);
        assert_eq!(classify(999), DriverErrorKind::Other);
    }

    #[test]
    fn test_prop_layout() {
        // Matches sizeof(CUmemAllocationProp) on 64-bit targets.
        assert_eq!(std::mem::size_of::<CUmemAllocationProp>(), 32);
        assert_eq!(std::mem::size_of::<CUmemAccessDesc>(), 12);
    }

    #[test]
    fn test_load_is_graceful() {
        // Either loads or reports unavailability; never panics.
        match CudaDriver::load() {
            Ok(driver) => {
                assert_eq!(driver.name(), "CUDA");
                if driver.device_count().unwrap_or(0) > 0 {
                    driver.mem_info(DeviceId(0)).unwrap();
                    driver.mem_info(DeviceId(0)).unwrap();
                    driver.synchronize(DeviceId(0)).unwrap();
                    assert_eq!(driver.retained_contexts(), 1);
                }
            }
            Err(err) => assert!(matches!(
                err.kind,
                DriverErrorKind::Unavailable | DriverErrorKind::NotInitialized | DriverErrorKind::Other
            )),
        }
    }
}
