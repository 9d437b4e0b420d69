//! Device LUID resolution.
//!
//! Some runtimes cannot answer `cuDeviceGetLuid`, which host frameworks use
//! to pair a compute device with a display adapter. The answer is
//! recovered by enumerating display adapters and taking the first one from
//! the expected vendor; the node mask is always 1 (single-node adapters).

use crate::{HookError, HookResult};

/// PCI vendor id of AMD.
pub const AMD_VENDOR_ID: u32 = 0x1002;

/// Node mask reported with every resolved LUID.
pub const SINGLE_NODE_MASK: u32 = 1;

/// A display adapter as reported by the OS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterDesc {
    /// Adapter description string.
    pub description: String,
    /// PCI vendor id.
    pub vendor_id: u32,
    /// Locally unique identifier, little-endian `LowPart` then `HighPart`.
    pub luid: [u8; 8],
}

/// A resolved device identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceLuid {
    /// Adapter LUID bytes.
    pub luid: [u8; 8],
    /// Node mask.
    pub node_mask: u32,
}

/// Source of display adapters.
pub trait AdapterEnumerator {
    /// Adapters in OS enumeration order.
    ///
    /// # Errors
    ///
    /// Returns an error if enumeration is unavailable.
    fn adapters(&self) -> HookResult<Vec<AdapterDesc>>;
}

/// First adapter from `vendor_id`.
///
/// # Errors
///
/// Returns [`HookError::Unsupported`] if no adapter matches, or the
/// enumeration failure.
pub fn resolve_luid(enumerator: &dyn AdapterEnumerator, vendor_id: u32) -> HookResult<DeviceLuid> {
    let adapter = enumerator
        .adapters()?
        .into_iter()
        .find(|a| a.vendor_id == vendor_id)
        .ok_or(HookError::Unsupported("LUID query without a matching adapter"))?;
    tracing::debug!(vendor = vendor_id, "LUID from adapter {}", adapter.description);
    Ok(DeviceLuid {
        luid: adapter.luid,
        node_mask: SINGLE_NODE_MASK,
    })
}

#[cfg(windows)]
pub use dxgi::DxgiEnumerator;

#[cfg(windows)]
mod dxgi {
    use super::{AdapterDesc, AdapterEnumerator};
    use crate::{HookError, HookResult};
    use std::ffi::c_void;

    const S_OK: i32 = 0;

    const RELEASE: usize = 2;
    const FACTORY_ENUM_ADAPTERS1: usize = 12;
    const ADAPTER_GET_DESC1: usize = 10;

    #[repr(C)]
    struct Guid {
        data1: u32,
        data2: u16,
        data3: u16,
        data4: [u8; 8],
    }

    const IID_IDXGI_FACTORY1: Guid = Guid {
        data1: 0x770a_ae78,
        data2: 0xf26f,
        data3: 0x4dba,
        data4: [0xa8, 0x29, 0x25, 0x3c, 0x83, 0xd1, 0xb3, 0x87],
    };

    #[repr(C)]
    struct AdapterDesc1 {
        description: [u16; 128],
        vendor_id: u32,
        device_id: u32,
        sub_sys_id: u32,
        revision: u32,
        dedicated_video_memory: usize,
        dedicated_system_memory: usize,
        shared_system_memory: usize,
        luid_low: u32,
        luid_high: i32,
        flags: u32,
    }

    type CreateFactory1 = unsafe extern "system" fn(*const Guid, *mut *mut c_void) -> i32;
    type ReleaseFn = unsafe extern "system" fn(*mut c_void) -> u32;
    type EnumAdapters1 = unsafe extern "system" fn(*mut c_void, u32, *mut *mut c_void) -> i32;
    type GetDesc1 = unsafe extern "system" fn(*mut c_void, *mut AdapterDesc1) -> i32;

    /// Reads slot `index` of a COM object's vtable.
    unsafe fn vtable_entry(object: *mut c_void, index: usize) -> *const c_void {
        let vtable = *(object as *const *const *const c_void);
        *vtable.add(index)
    }

    unsafe fn release(object: *mut c_void) {
        let f: ReleaseFn = std::mem::transmute(vtable_entry(object, RELEASE));
        f(object);
    }

    /// Enumerates adapters through DXGI (`dxgi.dll`, loaded at runtime).
    #[derive(Debug, Default)]
    pub struct DxgiEnumerator;

    impl AdapterEnumerator for DxgiEnumerator {
        fn adapters(&self) -> HookResult<Vec<AdapterDesc>> {
            // SAFETY: dxgi.dll has no initialization side effects we rely on.
            let lib = unsafe { libloading::Library::new("dxgi.dll") }.map_err(|err| {
                HookError::LibraryNotFound {
                    library: "dxgi.dll".to_string(),
                    reason: err.to_string(),
                }
            })?;
            // SAFETY: CreateDXGIFactory1 has the declared signature.
            let create = unsafe { lib.get::<CreateFactory1>(b"CreateDXGIFactory1") }.map_err(|err| {
                HookError::SymbolNotFound {
                    symbol: "CreateDXGIFactory1".to_string(),
                    reason: err.to_string(),
                }
            })?;

            let mut factory = std::ptr::null_mut();
            // SAFETY: valid IID and out pointer.
            if unsafe { create(&IID_IDXGI_FACTORY1, &mut factory) } != S_OK || factory.is_null() {
                return Err(HookError::Unsupported("DXGI factory creation"));
            }

            let mut out = Vec::new();
            // SAFETY: factory is a live IDXGIFactory1; adapters are released
            // after use and the factory before returning.
            unsafe {
                let enum_adapters: EnumAdapters1 =
                    std::mem::transmute(vtable_entry(factory, FACTORY_ENUM_ADAPTERS1));
                let mut index = 0;
                loop {
                    let mut adapter = std::ptr::null_mut();
                    let hr = enum_adapters(factory, index, &mut adapter);
                    // DXGI_ERROR_NOT_FOUND past the last adapter.
                    if hr != S_OK || adapter.is_null() {
                        break;
                    }
                    let get_desc: GetDesc1 = std::mem::transmute(vtable_entry(adapter, ADAPTER_GET_DESC1));
                    let mut desc: AdapterDesc1 = std::mem::zeroed();
                    if get_desc(adapter, &mut desc) == S_OK {
                        let len = desc.description.iter().position(|&c| c == 0).unwrap_or(128);
                        let mut luid = [0u8; 8];
                        luid[..4].copy_from_slice(&desc.luid_low.to_le_bytes());
                        luid[4..].copy_from_slice(&desc.luid_high.to_le_bytes());
                        out.push(AdapterDesc {
                            description: String::from_utf16_lossy(&desc.description[..len]),
                            vendor_id: desc.vendor_id,
                            luid,
                        });
                    }
                    release(adapter);
                    index += 1;
                }
                release(factory);
            }
            Ok(out)
        }
    }
}

/// `cuDeviceGetLuid` for runtimes that lack one.
///
/// Returns 0 on success and 801 (not supported) when no AMD adapter is
/// found.
///
/// # Safety
///
/// `luid` must be null or valid for 8 bytes; `node_mask` must be null or
/// valid for one `u32`.
#[cfg(all(windows, feature = "luid-shim"))]
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn cuDeviceGetLuid(
    luid: *mut std::ffi::c_char,
    node_mask: *mut std::ffi::c_uint,
    _device: std::ffi::c_int,
) -> std::ffi::c_int {
    const NOT_SUPPORTED: std::ffi::c_int = 801;
    let resolved = std::panic::catch_unwind(|| resolve_luid(&DxgiEnumerator, AMD_VENDOR_ID));
    match resolved {
        Ok(Ok(id)) => {
            if !luid.is_null() {
                std::ptr::copy_nonoverlapping(id.luid.as_ptr(), luid.cast::<u8>(), 8);
            }
            if !node_mask.is_null() {
                *node_mask = id.node_mask;
            }
            0
        }
        Ok(Err(err)) => {
            tracing::warn!("cuDeviceGetLuid: {}", err);
            NOT_SUPPORTED
        }
        Err(_) => NOT_SUPPORTED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedAdapters(Vec<AdapterDesc>);

    impl AdapterEnumerator for FixedAdapters {
        fn adapters(&self) -> HookResult<Vec<AdapterDesc>> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    impl AdapterEnumerator for Failing {
        fn adapters(&self) -> HookResult<Vec<AdapterDesc>> {
            Err(HookError::Unsupported("adapter enumeration"))
        }
    }

    fn adapter(name: &str, vendor_id: u32, last: u8) -> AdapterDesc {
        AdapterDesc {
            description: name.to_string(),
            vendor_id,
            luid: [1, 2, 3, 4, 5, 6, 7, last],
        }
    }

    #[test]
    fn test_first_matching_vendor_wins() {
        let adapters = FixedAdapters(vec![
            adapter("Microsoft Basic Render Driver", 0x1414, 1),
            adapter("Radeon RX 7900 XTX", AMD_VENDOR_ID, 2),
            adapter("Radeon Graphics", AMD_VENDOR_ID, 3),
        ]);
        let id = resolve_luid(&adapters, AMD_VENDOR_ID).unwrap();
        assert_eq!(id.luid[7], 2);
        assert_eq!(id.node_mask, SINGLE_NODE_MASK);
    }

    #[test]
    fn test_no_matching_vendor() {
        let adapters = FixedAdapters(vec![adapter("GeForce", 0x10DE, 1)]);
        assert!(matches!(
            resolve_luid(&adapters, AMD_VENDOR_ID),
            Err(HookError::Unsupported(_))
        ));
    }

    #[test]
    fn test_enumeration_failure_propagates() {
        assert!(resolve_luid(&Failing, AMD_VENDOR_ID).is_err());
    }
}
