//! C ABI behaviour
//!
//! Drives the exported functions the way a foreign caller would, against a
//! runtime backed by the mock driver.

use parking_lot::Mutex;
use std::ffi::{c_char, CStr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use vbar_core::EngineConfig;
use vbar_driver::{DeviceId, MockDeviceConfig, MockDriver, MockOp};
use vbar_hooks::NoopHookInstaller;
use vbar_host::ffi::*;
use vbar_host::runtime;

const MIB: u64 = 1 << 20;

/// The runtime slot is process-wide.
static SLOT: Mutex<()> = parking_lot::const_mutex(());

fn start(memory: usize) -> Arc<MockDriver> {
    let driver = Arc::new(MockDriver::new(MockDeviceConfig::with_memory(memory)));
    runtime::install(
        driver.clone(),
        EngineConfig::default(),
        DeviceId(0),
        Box::new(NoopHookInstaller),
    )
    .unwrap();
    driver
}

// ============================================================================
// VBAR lifecycle
// ============================================================================

#[test]
fn test_vbar_lifecycle() {
    let _slot = SLOT.lock();
    start(1 << 30);

    let handle = vbar_create(0, 512 * MIB, 0);
    assert_ne!(handle, 0);
    assert_ne!(vbar_get_base(handle), 0);
    assert_eq!(vbar_capacity(handle), 512 * MIB);

    let mut offset = u64::MAX;
    assert_eq!(unsafe { vbar_alloc(handle, 64 * MIB, &mut offset) }, 0);
    assert_eq!(offset, 0);

    let slots = vbar_signature_len(handle, 64 * MIB);
    assert_eq!(slots, 4);
    let mut first = vec![0u32; slots];
    let status = unsafe { vbar_fault(handle, offset, 64 * MIB, first.as_mut_ptr(), slots) };
    assert_eq!(status, 0);
    assert_eq!(vbar_loaded_size(handle), 64 * MIB);

    let mut short = [0u32; 1];
    let status = unsafe { vbar_fault(handle, offset, 64 * MIB, short.as_mut_ptr(), 1) };
    assert_eq!(status, -1);

    assert_eq!(vbar_unpin(handle, offset, 64 * MIB), 0);
    assert_eq!(vbar_free_memory(handle, 32 * MIB), 32 * MIB);
    assert_eq!(vbar_loaded_size(handle), 32 * MIB);

    let mut second = vec![0u32; slots];
    let status = unsafe { vbar_fault(handle, offset, 64 * MIB, second.as_mut_ptr(), slots) };
    assert_eq!(status, 0);
    assert_ne!(first, second);
    assert_eq!(vbar_unpin(handle, offset, 64 * MIB), 0);

    assert_eq!(vbar_set_watermark_limit(handle, 32 * MIB), 0);
    assert_eq!(vbar_loaded_size(handle), 32 * MIB);
    vbars_reset_watermark_limits();

    vbar_free(handle);
    assert_eq!(vbar_get_base(handle), 0);

    vbar_cleanup();
    assert_eq!(vbar_create(0, 64 * MIB, 0), 0);
}

#[test]
fn test_priority_and_device_reclaim() {
    let _slot = SLOT.lock();
    start(1 << 30);

    let keep = vbar_create(0, 256 * MIB, 0);
    let drop_first = vbar_create(0, 256 * MIB, 0);
    assert_eq!(vbar_prioritize(keep), 0);
    assert_eq!(vbar_deprioritize(drop_first), 0);

    for handle in [keep, drop_first] {
        let status = unsafe { vbar_fault(handle, 0, 64 * MIB, std::ptr::null_mut(), 0) };
        assert_eq!(status, 0);
        assert_eq!(vbar_unpin(handle, 0, 64 * MIB), 0);
    }

    assert_eq!(vbars_free(0, 64 * MIB), 64 * MIB);
    assert_eq!(vbar_loaded_size(drop_first), 0);
    assert_eq!(vbar_loaded_size(keep), 64 * MIB);

    vbar_cleanup();
}

// ============================================================================
// Host allocator plug-in
// ============================================================================

static PRESSURE_CALLS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn on_pressure() {
    PRESSURE_CALLS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_allocator_plugin() {
    let _slot = SLOT.lock();
    start(1 << 30);
    set_empty_cache(Some(on_pressure));

    let ptr = unsafe { alloc_fn(3 * MIB as usize, 0, std::ptr::null_mut()) };
    assert!(!ptr.is_null());
    assert_eq!(get_total_vram_usage(), 4 * MIB);
    unsafe { free_fn(ptr, 3 * MIB as usize, 0, std::ptr::null_mut()) };
    assert_eq!(get_total_vram_usage(), 0);

    let before = PRESSURE_CALLS.load(Ordering::SeqCst);
    let ptr = unsafe { alloc_fn(2 << 30, 0, std::ptr::null_mut()) };
    assert!(ptr.is_null());
    assert_eq!(PRESSURE_CALLS.load(Ordering::SeqCst), before + 1);

    set_empty_cache(None);
    vbar_cleanup();
}

#[test]
fn test_allocator_rejects_foreign_device() {
    let _slot = SLOT.lock();
    let driver = start(1 << 30);

    let ptr = unsafe { alloc_fn(MIB as usize, 1, std::ptr::null_mut()) };
    assert!(ptr.is_null());
    assert_eq!(driver.calls(MockOp::AllocAsync), 0);
    assert_eq!(get_total_vram_usage(), 0);

    let ptr = unsafe { alloc_fn(MIB as usize, 0, std::ptr::null_mut()) };
    assert!(!ptr.is_null());
    unsafe { free_fn(ptr, MIB as usize, 0, std::ptr::null_mut()) };
    vbar_cleanup();
}

#[test]
fn test_allocator_host_pressure_evicts_weights() {
    let _slot = SLOT.lock();
    let driver = start(512 << 20);

    let handle = vbar_create(0, 1 << 30, 0);
    let status = unsafe { vbar_fault(handle, 0, 384 * MIB, std::ptr::null_mut(), 0) };
    assert_eq!(status, 0);
    assert_eq!(vbar_unpin(handle, 0, 384 * MIB), 0);

    // Default headroom is 256 MiB; 128 MiB are free.
    let ptr = unsafe { alloc_fn(64 * MIB as usize, 0, std::ptr::null_mut()) };
    assert!(!ptr.is_null());
    assert!(vbar_loaded_size(handle) <= 192 * MIB);
    let info = vbar_driver::DriverBackend::mem_info(driver.as_ref(), DeviceId(0)).unwrap();
    assert!(info.free >= 256 * MIB as usize);

    unsafe { free_fn(ptr, 64 * MIB as usize, 0, std::ptr::null_mut()) };
    vbar_cleanup();
}

// ============================================================================
// Views and VRAM buffers
// ============================================================================

#[test]
fn test_array_interface_export() {
    let _slot = SLOT.lock();
    start(1 << 30);

    let handle = vbar_create(0, 64 * MIB, 0);
    let needed = unsafe { vbar_array_interface(handle, 512, 4096, std::ptr::null_mut(), 0) };
    assert!(needed > 0);

    let mut text = vec![0 as c_char; needed as usize + 1];
    let written = unsafe { vbar_array_interface(handle, 512, 4096, text.as_mut_ptr(), text.len()) };
    assert_eq!(written, needed);
    let json = unsafe { CStr::from_ptr(text.as_ptr()) }.to_str().unwrap();
    let value: serde_json::Value = serde_json::from_str(json).unwrap();
    assert_eq!(value["shape"][0], 4096);
    assert_eq!(value["data"][0], vbar_get_base(handle) + 512);

    let beyond = unsafe { vbar_array_interface(handle, 64 * MIB, 1, std::ptr::null_mut(), 0) };
    assert_eq!(beyond, -1);
    vbar_cleanup();
}

#[test]
fn test_vram_buffer_accounting() {
    let _slot = SLOT.lock();
    start(1 << 30);

    let buf = vrambuf_create(0, 10 * MIB as usize, 0);
    assert!(!buf.is_null());
    unsafe {
        assert_ne!(vrambuf_get(buf), 0);
        assert!(vrambuf_grow(buf, 3 * MIB as usize));
        assert_eq!(get_total_vram_usage(), 4 * MIB);
        assert!(!vrambuf_grow(buf, 20 * MIB as usize));
        vrambuf_destroy(buf);
    }
    assert_eq!(get_total_vram_usage(), 0);
    vbar_cleanup();
}

// ============================================================================
// Bad arguments
// ============================================================================

#[test]
fn test_invalid_arguments_fail_softly() {
    let _slot = SLOT.lock();
    assert!(unsafe { alloc_fn(1024, 0, std::ptr::null_mut()) }.is_null());
    assert_eq!(get_total_vram_usage(), 0);

    start(1 << 30);
    assert_eq!(vbar_create(-1, 64 * MIB, 0), 0);
    assert_eq!(vbar_create(0, 64 * MIB, 0x1234), 0);
    assert_eq!(unsafe { vbar_fault(0, 0, 1, std::ptr::null_mut(), 0) }, -1);
    assert_eq!(vbar_unpin(0, 0, 1), -1);
    assert_eq!(unsafe { vbar_alloc(0, 1, std::ptr::null_mut()) }, -1);
    unsafe { vrambuf_destroy(std::ptr::null_mut()) };
    vbar_free(0);
    vbar_cleanup();
}
