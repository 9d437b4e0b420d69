//! HIP backend for AMD devices.
//!
//! Loaded at runtime from `libamdhip64` (or `amdhip64.dll`). HIP mirrors
//! the CUDA virtual-memory API closely; the differences handled here are
//! pointer-typed device addresses and allocation handles, and the implicit
//! current device instead of explicit contexts.

#![allow(non_snake_case)]

use super::DriverBackend;
use crate::device::{DeviceId, DeviceInfo, DeviceKind, MemInfo};
use crate::memory::{Access, DevicePtr, PhysHandle, StreamHandle};
use crate::{DriverError, DriverErrorKind, DriverResult};
use std::ffi::{c_char, c_int, c_uint, c_ulonglong, c_void, CStr};
use std::sync::OnceLock;

// ============================================================================
// HIP Types
// ============================================================================

type HipError = c_int;
type HipDevice = c_int;
type HipStream = *mut c_void;
type HipMemHandle = *mut c_void;

const HIP_SUCCESS: HipError = 0;
const HIP_ERROR_INVALID_VALUE: HipError = 1;
const HIP_ERROR_OUT_OF_MEMORY: HipError = 2;
const HIP_ERROR_NOT_INITIALIZED: HipError = 3;
const HIP_ERROR_NOT_SUPPORTED: HipError = 801;

const HIP_MEM_ALLOCATION_TYPE_PINNED: c_uint = 1;
const HIP_MEM_HANDLE_TYPE_NONE: c_uint = 0;
const HIP_MEM_LOCATION_TYPE_DEVICE: c_uint = 1;
const HIP_MEM_ACCESS_FLAGS_PROT_READ: c_uint = 1;
const HIP_MEM_ACCESS_FLAGS_PROT_READWRITE: c_uint = 3;
const HIP_MEM_ALLOC_GRANULARITY_MINIMUM: c_uint = 0;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct HipMemLocation {
    type_: c_uint,
    id: c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct HipMemAllocFlags {
    compressionType: u8,
    gpuDirectRDMACapable: u8,
    usage: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct HipMemAllocationProp {
    type_: c_uint,
    requestedHandleType: c_uint,
    location: HipMemLocation,
    win32HandleMetaData: *mut c_void,
    allocFlags: HipMemAllocFlags,
}

impl HipMemAllocationProp {
    fn pinned_on(device: HipDevice) -> Self {
        Self {
            type_: HIP_MEM_ALLOCATION_TYPE_PINNED,
            requestedHandleType: HIP_MEM_HANDLE_TYPE_NONE,
            location: HipMemLocation {
                type_: HIP_MEM_LOCATION_TYPE_DEVICE,
                id: device,
            },
            win32HandleMetaData: std::ptr::null_mut(),
            allocFlags: HipMemAllocFlags::default(),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct HipMemAccessDesc {
    location: HipMemLocation,
    flags: c_uint,
}

// ============================================================================
// HIP Function Signatures
// ============================================================================

type FnHipInit = unsafe extern "C" fn(flags: c_uint) -> HipError;
type FnHipGetDeviceCount = unsafe extern "C" fn(count: *mut c_int) -> HipError;
type FnHipSetDevice = unsafe extern "C" fn(device: c_int) -> HipError;
type FnHipGetDevice = unsafe extern "C" fn(device: *mut c_int) -> HipError;
type FnHipDeviceGetName =
    unsafe extern "C" fn(name: *mut c_char, len: c_int, dev: HipDevice) -> HipError;
type FnHipDeviceTotalMem = unsafe extern "C" fn(bytes: *mut usize, dev: HipDevice) -> HipError;
type FnHipDeviceSynchronize = unsafe extern "C" fn() -> HipError;
type FnHipMemGetInfo = unsafe extern "C" fn(free: *mut usize, total: *mut usize) -> HipError;
type FnHipMemAddressReserve = unsafe extern "C" fn(
    ptr: *mut *mut c_void,
    size: usize,
    alignment: usize,
    addr: *mut c_void,
    flags: c_ulonglong,
) -> HipError;
type FnHipMemAddressFree = unsafe extern "C" fn(ptr: *mut c_void, size: usize) -> HipError;
type FnHipMemCreate = unsafe extern "C" fn(
    handle: *mut HipMemHandle,
    size: usize,
    prop: *const HipMemAllocationProp,
    flags: c_ulonglong,
) -> HipError;
type FnHipMemRelease = unsafe extern "C" fn(handle: HipMemHandle) -> HipError;
type FnHipMemMap = unsafe extern "C" fn(
    ptr: *mut c_void,
    size: usize,
    offset: usize,
    handle: HipMemHandle,
    flags: c_ulonglong,
) -> HipError;
type FnHipMemUnmap = unsafe extern "C" fn(ptr: *mut c_void, size: usize) -> HipError;
type FnHipMemSetAccess = unsafe extern "C" fn(
    ptr: *mut c_void,
    size: usize,
    desc: *const HipMemAccessDesc,
    count: usize,
) -> HipError;
type FnHipMemGetAllocationGranularity = unsafe extern "C" fn(
    granularity: *mut usize,
    prop: *const HipMemAllocationProp,
    option: c_uint,
) -> HipError;
type FnHipMallocAsync =
    unsafe extern "C" fn(ptr: *mut *mut c_void, size: usize, stream: HipStream) -> HipError;
type FnHipFreeAsync = unsafe extern "C" fn(ptr: *mut c_void, stream: HipStream) -> HipError;
type FnHipGetErrorString = unsafe extern "C" fn(error: HipError) -> *const c_char;

// ============================================================================
// Dynamic Library Loading
// ============================================================================

struct HipApi {
    hipInit: FnHipInit,
    hipGetDeviceCount: FnHipGetDeviceCount,
    hipSetDevice: FnHipSetDevice,
    hipGetDevice: FnHipGetDevice,
    hipDeviceGetName: FnHipDeviceGetName,
    hipDeviceTotalMem: FnHipDeviceTotalMem,
    hipDeviceSynchronize: FnHipDeviceSynchronize,
    hipMemGetInfo: FnHipMemGetInfo,
    hipMemAddressReserve: FnHipMemAddressReserve,
    hipMemAddressFree: FnHipMemAddressFree,
    hipMemCreate: FnHipMemCreate,
    hipMemRelease: FnHipMemRelease,
    hipMemMap: FnHipMemMap,
    hipMemUnmap: FnHipMemUnmap,
    hipMemSetAccess: FnHipMemSetAccess,
    hipMemGetAllocationGranularity: FnHipMemGetAllocationGranularity,
    hipMallocAsync: FnHipMallocAsync,
    hipFreeAsync: FnHipFreeAsync,
    hipGetErrorString: FnHipGetErrorString,
}

static HIP_API: OnceLock<Option<HipApi>> = OnceLock::new();

fn load_hip_api() -> Option<HipApi> {
    #[cfg(target_os = "linux")]
    let lib_names = ["libamdhip64.so", "libamdhip64.so.6", "libamdhip64.so.5"];

    #[cfg(target_os = "windows")]
    let lib_names = ["amdhip64.dll", "amdhip64_6.dll"];

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    let lib_names: [&str; 0] = [];

    lib_names.into_iter().find_map(try_load_hip_from)
}

fn try_load_hip_from(lib_name: &str) -> Option<HipApi> {
    tracing::debug!("attempting to load HIP from: {}", lib_name);

    // Safety: signatures match hip_runtime_api.h.
    unsafe {
        let lib = libloading::Library::new(lib_name).ok()?;

        let api = HipApi {
            hipInit: *lib.get::<FnHipInit>(b"hipInit").ok()?,
            hipGetDeviceCount: *lib.get::<FnHipGetDeviceCount>(b"hipGetDeviceCount").ok()?,
            hipSetDevice: *lib.get::<FnHipSetDevice>(b"hipSetDevice").ok()?,
            hipGetDevice: *lib.get::<FnHipGetDevice>(b"hipGetDevice").ok()?,
            hipDeviceGetName: *lib.get::<FnHipDeviceGetName>(b"hipDeviceGetName").ok()?,
            hipDeviceTotalMem: *lib.get::<FnHipDeviceTotalMem>(b"hipDeviceTotalMem").ok()?,
            hipDeviceSynchronize: *lib
                .get::<FnHipDeviceSynchronize>(b"hipDeviceSynchronize")
                .ok()?,
            hipMemGetInfo: *lib.get::<FnHipMemGetInfo>(b"hipMemGetInfo").ok()?,
            hipMemAddressReserve: *lib
                .get::<FnHipMemAddressReserve>(b"hipMemAddressReserve")
                .ok()?,
            hipMemAddressFree: *lib.get::<FnHipMemAddressFree>(b"hipMemAddressFree").ok()?,
            hipMemCreate: *lib.get::<FnHipMemCreate>(b"hipMemCreate").ok()?,
            hipMemRelease: *lib.get::<FnHipMemRelease>(b"hipMemRelease").ok()?,
            hipMemMap: *lib.get::<FnHipMemMap>(b"hipMemMap").ok()?,
            hipMemUnmap: *lib.get::<FnHipMemUnmap>(b"hipMemUnmap").ok()?,
            hipMemSetAccess: *lib.get::<FnHipMemSetAccess>(b"hipMemSetAccess").ok()?,
            hipMemGetAllocationGranularity: *lib
                .get::<FnHipMemGetAllocationGranularity>(b"hipMemGetAllocationGranularity")
                .ok()?,
            hipMallocAsync: *lib.get::<FnHipMallocAsync>(b"hipMallocAsync").ok()?,
            hipFreeAsync: *lib.get::<FnHipFreeAsync>(b"hipFreeAsync").ok()?,
            hipGetErrorString: *lib.get::<FnHipGetErrorString>(b"hipGetErrorString").ok()?,
        };

        std::mem::forget(lib);

        tracing::info!("loaded HIP runtime library: {}", lib_name);
        Some(api)
    }
}

fn get_hip_api() -> Option<&'static HipApi> {
    HIP_API.get_or_init(load_hip_api).as_ref()
}

fn classify(result: HipError) -> DriverErrorKind {
    match result {
        HIP_ERROR_OUT_OF_MEMORY => DriverErrorKind::OutOfMemory,
        HIP_ERROR_INVALID_VALUE => DriverErrorKind::InvalidValue,
        HIP_ERROR_NOT_INITIALIZED => DriverErrorKind::NotInitialized,
        HIP_ERROR_NOT_SUPPORTED => DriverErrorKind::NotSupported,
        _ => DriverErrorKind::Other,
    }
}

fn check_hip(result: HipError, op: &'static str) -> DriverResult<()> {
    if result == HIP_SUCCESS {
        return Ok(());
    }
    let message = get_hip_api()
        .map(|api| {
            // Safety: hipGetErrorString returns a static string or null.
            unsafe {
                let msg = (api.hipGetErrorString)(result);
                if msg.is_null() {
                    format!("error code {result}")
                } else {
                    CStr::from_ptr(msg).to_string_lossy().into_owned()
                }
            }
        })
        .unwrap_or_else(|| format!("error code {result}"));
    let err = DriverError::new(op, classify(result), result, message);
    tracing::error!(code = result, "{}", err);
    Err(err)
}

fn hip_device(device: DeviceId) -> DriverResult<HipDevice> {
    HipDevice::try_from(device.0)
        .map_err(|_| DriverError::invalid_value("device", format!("bad ordinal {device}")))
}

fn as_void(va: DevicePtr) -> *mut c_void {
    va.0 as usize as *mut c_void
}

/// HIP implementation of [`DriverBackend`].
pub struct HipDriver {
    api: &'static HipApi,
}

impl HipDriver {
    /// Load the HIP runtime and call `hipInit`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverErrorKind::Unavailable`] if the runtime is not
    /// installed, or the `hipInit` failure.
    pub fn load() -> DriverResult<Self> {
        let api = get_hip_api()
            .ok_or_else(|| DriverError::unavailable("load", "HIP runtime not available"))?;
        // Safety: no pointers.
        unsafe {
            check_hip((api.hipInit)(0), "hipInit")?;
        }
        Ok(Self { api })
    }

    /// Check if HIP is available on this system.
    #[must_use]
    pub fn is_available() -> bool {
        get_hip_api().is_some()
    }

    /// Run `f` with `device` current on the calling thread, then restore
    /// whichever device was current before.
    fn scoped<T>(&self, device: DeviceId, f: impl FnOnce() -> DriverResult<T>) -> DriverResult<T> {
        let target = hip_device(device)?;
        let previous = self.current_device()?;
        if previous == target {
            return f();
        }
        // Safety: no pointers.
        unsafe {
            check_hip((self.api.hipSetDevice)(target), "hipSetDevice")?;
        }
        let result = f();
        // Safety: no pointers.
        let restore = unsafe { check_hip((self.api.hipSetDevice)(previous), "hipSetDevice") };
        let value = result?;
        restore?;
        Ok(value)
    }

    fn current_device(&self) -> DriverResult<c_int> {
        let mut current: c_int = 0;
        // Safety: out-pointer is a valid local.
        unsafe {
            check_hip((self.api.hipGetDevice)(&mut current), "hipGetDevice")?;
        }
        Ok(current)
    }
}

impl DriverBackend for HipDriver {
    fn name(&self) -> &'static str {
        "ROCm"
    }

    fn init(&self, device: DeviceId) -> DriverResult<()> {
        // Safety: no pointers.
        unsafe { check_hip((self.api.hipSetDevice)(hip_device(device)?), "hipSetDevice") }
    }

    fn device_count(&self) -> DriverResult<u32> {
        let mut count: c_int = 0;
        // Safety: out-pointer is a valid local.
        unsafe {
            check_hip((self.api.hipGetDeviceCount)(&mut count), "hipGetDeviceCount")?;
        }
        Ok(u32::try_from(count).unwrap_or(0))
    }

    fn device_info(&self, device: DeviceId) -> DriverResult<DeviceInfo> {
        let dev = hip_device(device)?;
        let mut name_buf = [0 as c_char; 256];
        let mut total = 0usize;
        let mut granularity = 0usize;
        let prop = HipMemAllocationProp::pinned_on(dev);
        // Safety: buffers are sized as passed.
        let name = unsafe {
            check_hip(
                (self.api.hipDeviceGetName)(name_buf.as_mut_ptr(), 256, dev),
                "hipDeviceGetName",
            )?;
            check_hip((self.api.hipDeviceTotalMem)(&mut total, dev), "hipDeviceTotalMem")?;
            check_hip(
                (self.api.hipMemGetAllocationGranularity)(
                    &mut granularity,
                    &prop,
                    HIP_MEM_ALLOC_GRANULARITY_MINIMUM,
                ),
                "hipMemGetAllocationGranularity",
            )?;
            CStr::from_ptr(name_buf.as_ptr())
                .to_string_lossy()
                .into_owned()
        };
        Ok(DeviceInfo {
            id: device,
            kind: DeviceKind::Rocm,
            name,
            memory_total: total,
            allocation_granularity: granularity,
        })
    }

    fn reserve_va(&self, size: usize, alignment: usize) -> DriverResult<DevicePtr> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        // Safety: out-pointer is a valid local.
        unsafe {
            check_hip(
                (self.api.hipMemAddressReserve)(&mut ptr, size, alignment, std::ptr::null_mut(), 0),
                "hipMemAddressReserve",
            )?;
        }
        Ok(DevicePtr(ptr as u64))
    }

    fn free_va(&self, va: DevicePtr, size: usize) -> DriverResult<()> {
        // Safety: plain values.
        unsafe { check_hip((self.api.hipMemAddressFree)(as_void(va), size), "hipMemAddressFree") }
    }

    fn create_physical(&self, size: usize, device: DeviceId) -> DriverResult<PhysHandle> {
        let prop = HipMemAllocationProp::pinned_on(hip_device(device)?);
        let mut handle: HipMemHandle = std::ptr::null_mut();
        // Safety: out-pointer and prop are valid locals.
        unsafe {
            check_hip((self.api.hipMemCreate)(&mut handle, size, &prop, 0), "hipMemCreate")?;
        }
        Ok(PhysHandle(handle as u64))
    }

    fn release_physical(&self, handle: PhysHandle) -> DriverResult<()> {
        // Safety: the handle came from hipMemCreate.
        unsafe {
            check_hip(
                (self.api.hipMemRelease)(handle.0 as usize as HipMemHandle),
                "hipMemRelease",
            )
        }
    }

    fn map(&self, va: DevicePtr, size: usize, handle: PhysHandle) -> DriverResult<()> {
        // Safety: the handle came from hipMemCreate.
        unsafe {
            check_hip(
                (self.api.hipMemMap)(as_void(va), size, 0, handle.0 as usize as HipMemHandle, 0),
                "hipMemMap",
            )
        }
    }

    fn unmap(&self, va: DevicePtr, size: usize) -> DriverResult<()> {
        // Safety: plain values.
        unsafe { check_hip((self.api.hipMemUnmap)(as_void(va), size), "hipMemUnmap") }
    }

    fn set_access(
        &self,
        va: DevicePtr,
        size: usize,
        device: DeviceId,
        access: Access,
    ) -> DriverResult<()> {
        let desc = HipMemAccessDesc {
            location: HipMemLocation {
                type_: HIP_MEM_LOCATION_TYPE_DEVICE,
                id: hip_device(device)?,
            },
            flags: match access {
                Access::Read => HIP_MEM_ACCESS_FLAGS_PROT_READ,
                Access::ReadWrite => HIP_MEM_ACCESS_FLAGS_PROT_READWRITE,
            },
        };
        // Safety: desc is a valid local, count matches.
        unsafe {
            check_hip(
                (self.api.hipMemSetAccess)(as_void(va), size, &desc, 1),
                "hipMemSetAccess",
            )
        }
    }

    fn mem_info(&self, device: DeviceId) -> DriverResult<MemInfo> {
        self.scoped(device, || {
            let mut free = 0usize;
            let mut total = 0usize;
            // Safety: out-pointers are valid locals.
            unsafe {
                check_hip((self.api.hipMemGetInfo)(&mut free, &mut total), "hipMemGetInfo")?;
            }
            Ok(MemInfo { free, total })
        })
    }

    fn alloc_async(&self, size: usize, stream: StreamHandle) -> DriverResult<DevicePtr> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        // Safety: out-pointer is a valid local; the stream is the caller's.
        unsafe {
            check_hip(
                (self.api.hipMallocAsync)(&mut ptr, size, stream.as_ptr()),
                "hipMallocAsync",
            )?;
        }
        Ok(DevicePtr(ptr as u64))
    }

    fn free_async(&self, ptr: DevicePtr, stream: StreamHandle) -> DriverResult<()> {
        // Safety: plain values.
        unsafe {
            check_hip(
                (self.api.hipFreeAsync)(as_void(ptr), stream.as_ptr()),
                "hipFreeAsync",
            )
        }
    }

    fn synchronize(&self, device: DeviceId) -> DriverResult<()> {
        self.scoped(device, || {
            // Safety: no arguments.
            unsafe { check_hip((self.api.hipDeviceSynchronize)(), "hipDeviceSynchronize") }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_codes() {
        assert_eq!(classify(HIP_ERROR_OUT_OF_MEMORY), DriverErrorKind::OutOfMemory);
        assert_eq!(classify(HIP_ERROR_NOT_INITIALIZED), DriverErrorKind::NotInitialized);
        assert_eq!(classify(42), DriverErrorKind::Other);
    }

    #[test]
    fn test_load_is_graceful() {
        if let Err(err) = HipDriver::load() {
            assert_ne!(err.kind, DriverErrorKind::OutOfMemory);
        }
    }

    #[test]
    fn test_queries_keep_current_device() {
        let Ok(driver) = HipDriver::load() else {
            return;
        };
        let count = driver.device_count().unwrap_or(0);
        if count == 0 {
            return;
        }
        let before = driver.current_device().unwrap();
        let other = DeviceId(count - 1);
        driver.mem_info(other).unwrap();
        driver.synchronize(other).unwrap();
        assert_eq!(driver.current_device().unwrap(), before);
    }
}
