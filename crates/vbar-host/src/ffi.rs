//! C ABI entry points.
//!
//! These are the functions a host framework binds to from C or through a
//! foreign-function layer. They use the process runtime slot from
//! [`crate::runtime`].
//!
//! # Conventions
//!
//! - Buffers are named by a `u64` handle from `vbar_create`; 0 is never a
//!   valid handle and signals failure.
//! - Status-returning calls use 0 for success and -1 for failure.
//!   `vbar_fault` additionally returns 1 when the range could not be made
//!   resident.
//! - No function unwinds into the caller. Failures are logged and turned
//!   into the documented return value.

use crate::pressure::CallbackPressure;
use crate::runtime;
use crate::view::ExternalBufferView;
use crate::{HostAllocator, HostError, HostResult};
use std::ffi::{c_char, c_int, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use vbar_core::{BufferHandle, DeviceEngine, FaultOutcome, Signature, VbarError, VbarId, VramBuffer};
use vbar_driver::{DeviceId, DevicePtr, StreamHandle};

const STATUS_OK: c_int = 0;
const STATUS_NOT_RESIDENT: c_int = 1;
const STATUS_ERROR: c_int = -1;

/// Run `f`, logging and replacing failures and panics with `fallback`.
fn guarded<T>(op: &'static str, fallback: T, f: impl FnOnce() -> HostResult<T>) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            tracing::error!("{}: {}", op, err);
            fallback
        }
        Err(_) => {
            tracing::error!("{}: panicked", op);
            fallback
        }
    }
}

fn status(op: &'static str, f: impl FnOnce() -> HostResult<()>) -> c_int {
    guarded(op, STATUS_ERROR, || f().map(|()| STATUS_OK))
}

fn device_id(device: c_int) -> HostResult<DeviceId> {
    u32::try_from(device)
        .map(DeviceId)
        .map_err(|_| HostError::InvalidArgument("negative device ordinal"))
}

fn buffer(raw: u64) -> HostResult<(Arc<DeviceEngine>, VbarId)> {
    let handle = BufferHandle::from_raw(raw).ok_or(HostError::InvalidArgument("null buffer handle"))?;
    let engine = runtime::current()?.registry().engine_for(handle)?;
    Ok((engine, handle.id))
}

fn to_usize(value: u64, what: &'static str) -> HostResult<usize> {
    usize::try_from(value).map_err(|_| HostError::InvalidArgument(what))
}

// ----------------------------------------------------------------------
// Lifecycle
// ----------------------------------------------------------------------

/// Initialize the runtime for `device` and install the allocation hooks.
///
/// Returns `false` if the device, the driver or the hooks could not be set
/// up.
#[no_mangle]
pub extern "C" fn vbar_init(device: c_int) -> bool {
    guarded("vbar_init", false, || {
        runtime::init(device_id(device)?)?;
        Ok(true)
    })
}

/// Remove the hooks, destroy every VBAR and release the runtime.
#[no_mangle]
pub extern "C" fn vbar_cleanup() {
    guarded("vbar_cleanup", (), runtime::cleanup);
}

/// Device bytes held by host allocations and VRAM buffers.
#[no_mangle]
pub extern "C" fn get_total_vram_usage() -> u64 {
    guarded("get_total_vram_usage", 0, || {
        Ok(runtime::current()?.allocator().total_usage() as u64)
    })
}

/// Register the callback run when a host allocation fails after every
/// evictable page was reclaimed. `None` unregisters it.
#[no_mangle]
pub extern "C" fn set_empty_cache(callback: Option<extern "C" fn()>) {
    guarded("set_empty_cache", (), || {
        runtime::set_pressure_handler(
            callback.map(|cb| Arc::new(CallbackPressure::new(cb)) as Arc<dyn crate::PressureHandler>),
        );
        Ok(())
    });
}

// ----------------------------------------------------------------------
// Host caching-allocator plug-in
// ----------------------------------------------------------------------

fn host_allocator() -> HostResult<Arc<HostAllocator>> {
    Ok(Arc::clone(runtime::current()?.allocator()))
}

/// Allocation entry point of a pluggable caching allocator.
///
/// Only the runtime's device is served. Returns null on failure, including
/// requests for any other device.
///
/// # Safety
///
/// `stream` must be a stream of the runtime's device, or null for the
/// default stream.
#[no_mangle]
pub unsafe extern "C" fn alloc_fn(size: usize, device: c_int, stream: *mut c_void) -> *mut c_void {
    guarded("alloc_fn", std::ptr::null_mut(), || {
        let allocator = host_allocator()?;
        let requested = device_id(device)?;
        if requested != allocator.device() {
            tracing::error!(
                requested = %requested,
                runtime = %allocator.device(),
                size,
                "refusing allocation for a device the runtime does not manage"
            );
            return Err(HostError::InvalidArgument("device is not the runtime's device"));
        }
        let ptr = allocator.alloc(size, StreamHandle(stream as usize))?;
        Ok(ptr.as_raw() as usize as *mut c_void)
    })
}

/// Free entry point of a pluggable caching allocator.
///
/// # Safety
///
/// `ptr` must come from [`alloc_fn`] and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn free_fn(ptr: *mut c_void, _size: usize, _device: c_int, stream: *mut c_void) {
    guarded("free_fn", (), || {
        host_allocator()?.free(DevicePtr::from_raw(ptr as u64), StreamHandle(stream as usize))
    });
}

// ----------------------------------------------------------------------
// VBARs
// ----------------------------------------------------------------------

/// Create a VBAR of up to `size` bytes on `device`.
///
/// With `pre_reserved` non-zero, that already reserved address range is
/// used and `size` is taken as its exact length. Returns 0 on failure.
#[no_mangle]
pub extern "C" fn vbar_create(device: c_int, size: u64, pre_reserved: u64) -> u64 {
    guarded("vbar_create", 0, || {
        let device = device_id(device)?;
        let size = to_usize(size, "size exceeds the address width")?;
        let engine = runtime::current()?.engine(device)?;
        let id = if pre_reserved == 0 {
            engine.create(size)?
        } else {
            engine.create_on_reserved(DevicePtr::from_raw(pre_reserved), size)?
        };
        Ok(BufferHandle { device, id }.to_raw())
    })
}

/// Base device address of a VBAR, or 0.
#[no_mangle]
pub extern "C" fn vbar_get_base(handle: u64) -> u64 {
    guarded("vbar_get_base", 0, || {
        let (engine, id) = buffer(handle)?;
        Ok(engine.base(id)?.as_raw())
    })
}

/// Reserved bytes of a VBAR, or 0.
#[no_mangle]
pub extern "C" fn vbar_capacity(handle: u64) -> u64 {
    guarded("vbar_capacity", 0, || {
        let (engine, id) = buffer(handle)?;
        Ok(engine.capacity(id)? as u64)
    })
}

/// Hand out `size` bytes of address space; the offset is stored in
/// `offset`.
///
/// # Safety
///
/// `offset` must be valid for one `u64` write.
#[no_mangle]
pub unsafe extern "C" fn vbar_alloc(handle: u64, size: u64, offset: *mut u64) -> c_int {
    status("vbar_alloc", || {
        if offset.is_null() {
            return Err(HostError::InvalidArgument("null offset pointer"));
        }
        let (engine, id) = buffer(handle)?;
        let allocation = engine.alloc(id, to_usize(size, "size exceeds the address width")?)?;
        *offset = allocation.offset as u64;
        Ok(())
    })
}

/// Generation slots a caller must provide to `vbar_fault` for a range of
/// `size` bytes, or 0 for an unknown handle.
#[no_mangle]
pub extern "C" fn vbar_signature_len(handle: u64, size: u64) -> usize {
    guarded("vbar_signature_len", 0, || {
        let (engine, _) = buffer(handle)?;
        let size = to_usize(size, "size exceeds the address width")?;
        Ok(Signature::slots_for(size, engine.config().page_size))
    })
}

/// Make a range resident and pin it.
///
/// Returns 0 when resident (the generations are written to `signature`,
/// if non-null), 1 when the range could not be made resident (nothing
/// stays pinned) and -1 on error.
///
/// # Safety
///
/// If `signature` is non-null it must be valid for `slots` `u32` writes,
/// and `slots` must be at least `vbar_signature_len(handle, size)`.
#[no_mangle]
pub unsafe extern "C" fn vbar_fault(
    handle: u64,
    offset: u64,
    size: u64,
    signature: *mut u32,
    slots: usize,
) -> c_int {
    guarded("vbar_fault", STATUS_ERROR, || {
        let (engine, id) = buffer(handle)?;
        let offset = to_usize(offset, "offset exceeds the address width")?;
        let size = to_usize(size, "size exceeds the address width")?;
        if !signature.is_null() && slots < Signature::slots_for(size, engine.config().page_size) {
            return Err(HostError::InvalidArgument("signature buffer too small"));
        }
        match engine.fault(id, offset, size)? {
            FaultOutcome::Resident(sig) => {
                if !signature.is_null() {
                    sig.write_into(std::slice::from_raw_parts_mut(signature, slots));
                }
                Ok(STATUS_OK)
            }
            FaultOutcome::NotResident => Ok(STATUS_NOT_RESIDENT),
        }
    })
}

/// Release the pins of a range.
#[no_mangle]
pub extern "C" fn vbar_unpin(handle: u64, offset: u64, size: u64) -> c_int {
    status("vbar_unpin", || {
        let (engine, id) = buffer(handle)?;
        engine.unpin(
            id,
            to_usize(offset, "offset exceeds the address width")?,
            to_usize(size, "size exceeds the address width")?,
        )?;
        Ok(())
    })
}

/// Move a VBAR to the evicted-last end of its device's order.
#[no_mangle]
pub extern "C" fn vbar_prioritize(handle: u64) -> c_int {
    status("vbar_prioritize", || {
        let (engine, id) = buffer(handle)?;
        Ok(engine.prioritize(id)?)
    })
}

/// Move a VBAR to the evicted-first end of its device's order.
#[no_mangle]
pub extern "C" fn vbar_deprioritize(handle: u64) -> c_int {
    status("vbar_deprioritize", || {
        let (engine, id) = buffer(handle)?;
        Ok(engine.deprioritize(id)?)
    })
}

/// Cap the resident bytes of a VBAR (0 removes the cap).
#[no_mangle]
pub extern "C" fn vbar_set_watermark_limit(handle: u64, bytes: u64) -> c_int {
    status("vbar_set_watermark_limit", || {
        let (engine, id) = buffer(handle)?;
        engine.set_watermark_limit(id, to_usize(bytes, "limit exceeds the address width")?)?;
        Ok(())
    })
}

/// Remove the cap of every VBAR on every device.
#[no_mangle]
pub extern "C" fn vbars_reset_watermark_limits() {
    guarded("vbars_reset_watermark_limits", (), || {
        runtime::current()?.registry().reset_watermark_limits();
        Ok(())
    });
}

/// Resident bytes of a VBAR, or 0.
#[no_mangle]
pub extern "C" fn vbar_loaded_size(handle: u64) -> u64 {
    guarded("vbar_loaded_size", 0, || {
        let (engine, id) = buffer(handle)?;
        Ok(engine.loaded_size(id)? as u64)
    })
}

/// Evict unpinned pages of one VBAR until `bytes` were freed. Returns the
/// bytes evicted.
#[no_mangle]
pub extern "C" fn vbar_free_memory(handle: u64, bytes: u64) -> u64 {
    guarded("vbar_free_memory", 0, || {
        let (engine, id) = buffer(handle)?;
        let freed = engine.free_memory(id, to_usize(bytes, "size exceeds the address width")?)?;
        Ok(freed as u64)
    })
}

/// Evict across all VBARs of `device` in priority order and give the
/// memory back to the driver. Returns the bytes released.
#[no_mangle]
pub extern "C" fn vbars_free(device: c_int, bytes: u64) -> u64 {
    guarded("vbars_free", 0, || {
        let device = device_id(device)?;
        let bytes = to_usize(bytes, "size exceeds the address width")?;
        Ok(runtime::current()?.registry().reclaim(device, bytes)? as u64)
    })
}

/// Destroy a VBAR. Unknown handles are logged and otherwise ignored.
#[no_mangle]
pub extern "C" fn vbar_free(handle: u64) {
    guarded("vbar_free", (), || {
        let (engine, id) = buffer(handle)?;
        match engine.destroy(id) {
            Ok(()) | Err(VbarError::UnknownBuffer(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    });
}

/// Write the `__cuda_array_interface__` JSON of a range into `out`
/// (NUL-terminated) and return its length without the terminator.
///
/// If `capacity` is too small nothing is written; call again with the
/// returned length plus one. Returns -1 on error.
///
/// # Safety
///
/// `out` must be null or valid for `capacity` bytes.
#[no_mangle]
pub unsafe extern "C" fn vbar_array_interface(
    handle: u64,
    offset: u64,
    size: u64,
    out: *mut c_char,
    capacity: usize,
) -> isize {
    guarded("vbar_array_interface", -1, || {
        let (engine, id) = buffer(handle)?;
        let view = ExternalBufferView::of_range(
            &engine,
            id,
            to_usize(offset, "offset exceeds the address width")?,
            to_usize(size, "size exceeds the address width")?,
        )?;
        let text = view.array_interface().to_string();
        if !out.is_null() && capacity > text.len() {
            std::ptr::copy_nonoverlapping(text.as_ptr(), out.cast::<u8>(), text.len());
            *out.add(text.len()) = 0;
        }
        isize::try_from(text.len()).map_err(|_| HostError::InvalidArgument("interface too long"))
    })
}

// ----------------------------------------------------------------------
// Growable VRAM buffers
// ----------------------------------------------------------------------

struct ExportedVramBuffer {
    buffer: VramBuffer,
    allocator: Arc<HostAllocator>,
    accounted: usize,
}

/// Reserve a growable buffer of up to `max_size` bytes on `device`, on
/// `pre_reserved` if non-zero. Returns null on failure.
#[no_mangle]
pub extern "C" fn vrambuf_create(device: c_int, max_size: usize, pre_reserved: u64) -> *mut c_void {
    guarded("vrambuf_create", std::ptr::null_mut(), || {
        let device = device_id(device)?;
        let runtime = runtime::current()?;
        let registry = runtime.registry();
        let chunk_size = registry
            .config()
            .host_granularity
            .max(registry.driver().device_info(device)?.allocation_granularity);
        let pre_reserved = (pre_reserved != 0).then(|| DevicePtr::from_raw(pre_reserved));
        let buffer = VramBuffer::create(
            Arc::clone(registry.driver()),
            device,
            max_size,
            chunk_size,
            pre_reserved,
        )?;
        let exported = Box::new(ExportedVramBuffer {
            buffer,
            allocator: Arc::clone(runtime.allocator()),
            accounted: 0,
        });
        Ok(Box::into_raw(exported).cast())
    })
}

/// Back at least `required` bytes of the buffer. Returns `false` if the
/// buffer cannot grow that far.
///
/// # Safety
///
/// `buf` must come from [`vrambuf_create`] and not have been destroyed.
#[no_mangle]
pub unsafe extern "C" fn vrambuf_grow(buf: *mut c_void, required: usize) -> bool {
    guarded("vrambuf_grow", false, || {
        let exported = buf
            .cast::<ExportedVramBuffer>()
            .as_mut()
            .ok_or(HostError::InvalidArgument("null VRAM buffer"))?;
        let grown = exported.buffer.grow(required)?;
        let mapped = exported.buffer.mapped_size();
        if mapped > exported.accounted {
            exported.allocator.account_external(mapped - exported.accounted);
            exported.accounted = mapped;
        }
        Ok(grown)
    })
}

/// Base device address of the buffer, or 0.
///
/// # Safety
///
/// `buf` must come from [`vrambuf_create`] and not have been destroyed.
#[no_mangle]
pub unsafe extern "C" fn vrambuf_get(buf: *mut c_void) -> u64 {
    guarded("vrambuf_get", 0, || {
        let exported = buf
            .cast::<ExportedVramBuffer>()
            .as_ref()
            .ok_or(HostError::InvalidArgument("null VRAM buffer"))?;
        Ok(exported.buffer.base().as_raw())
    })
}

/// Unmap and release the buffer.
///
/// # Safety
///
/// `buf` must come from [`vrambuf_create`]; it is invalid afterwards.
#[no_mangle]
pub unsafe extern "C" fn vrambuf_destroy(buf: *mut c_void) {
    guarded("vrambuf_destroy", (), || {
        if buf.is_null() {
            return Ok(());
        }
        let exported = *Box::from_raw(buf.cast::<ExportedVramBuffer>());
        exported.allocator.release_external(exported.accounted);
        exported.buffer.destroy()?;
        Ok(())
    });
}
