//! Export-address-table patching on Windows.
//!
//! Each hooked export's slot in the runtime DLL's export address table is
//! rewritten to point at a small trampoline (`jmp [rip+0]; dq target`)
//! placed above the module, so the new RVA still fits in 32 bits. Every
//! `GetProcAddress` issued afterwards, including the host framework's lazy
//! runtime loading, lands in [`crate::router`].
//!
//! Imports bound before installation keep calling the originals.

use crate::pe::PeImage;
use crate::router::{
    self, FreeAsyncFn, FreeFn, MallocAsyncFn, MallocFn, OriginalEntryPoints,
};
use crate::{AllocatorHookInstaller, HookError, HookResult};
use libloading::os::windows::Library;
use parking_lot::Mutex;
use std::ffi::c_void;

const CUDA_RUNTIME_DLL: &str = "cudart64_12.dll";

const PAGE_READWRITE: u32 = 0x04;
const PAGE_EXECUTE_READWRITE: u32 = 0x40;
const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const ALLOCATION_GRANULE: usize = 0x1_0000;
const HEADER_PROBE: usize = 0x1000;
const TRAMPOLINE_STRIDE: usize = 16;
const TRAMPOLINE_BLOCK: usize = 0x1000;

#[link(name = "kernel32")]
extern "system" {
    fn VirtualProtect(addr: *mut c_void, size: usize, new_protect: u32, old: *mut u32) -> i32;
    fn VirtualAlloc(addr: *mut c_void, size: usize, alloc_type: u32, protect: u32) -> *mut c_void;
    fn FlushInstructionCache(process: *mut c_void, addr: *const c_void, size: usize) -> i32;
    fn GetCurrentProcess() -> *mut c_void;
    fn GetLastError() -> u32;
}

struct Target {
    name: &'static str,
    replacement: usize,
    required: bool,
}

fn targets() -> [Target; 4] {
    [
        Target {
            name: "cudaMalloc",
            replacement: router::hooked_malloc as usize,
            required: true,
        },
        Target {
            name: "cudaFree",
            replacement: router::hooked_free as usize,
            required: true,
        },
        Target {
            name: "cudaMallocAsync",
            replacement: router::hooked_malloc_async as usize,
            required: false,
        },
        Target {
            name: "cudaFreeAsync",
            replacement: router::hooked_free_async as usize,
            required: false,
        },
    ]
}

struct PatchedSlot {
    name: &'static str,
    slot: *mut u32,
    original_rva: u32,
    patched_rva: u32,
}

struct Installed {
    slots: Vec<PatchedSlot>,
}

// SAFETY: the slot pointers address the runtime DLL's export table, which
// stays mapped for the life of the process (the library handle is leaked).
unsafe impl Send for Installed {}

/// Installer that patches the export table of a runtime DLL.
pub struct ExportTablePatcher {
    module: String,
    installed: Mutex<Option<Installed>>,
}

impl ExportTablePatcher {
    /// Patch `module`.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            installed: Mutex::new(None),
        }
    }

    /// Patch the CUDA 12 runtime.
    #[must_use]
    pub fn cuda_runtime() -> Self {
        Self::new(CUDA_RUNTIME_DLL)
    }

    fn module_base(&self) -> HookResult<usize> {
        let library = Library::open_already_loaded(&self.module)
            .or_else(|_| unsafe { Library::new(&self.module) })
            .map_err(|err| HookError::LibraryNotFound {
                library: self.module.clone(),
                reason: err.to_string(),
            })?;
        Ok(library.into_raw() as usize)
    }
}

fn alloc_near(base: usize, image_size: usize) -> HookResult<*mut u8> {
    let limit = base + u32::MAX as usize - TRAMPOLINE_BLOCK;
    let mut hint = (base + image_size + ALLOCATION_GRANULE - 1) & !(ALLOCATION_GRANULE - 1);
    while hint < limit {
        // SAFETY: VirtualAlloc either reserves at the hint or returns null.
        let block = unsafe {
            VirtualAlloc(
                hint as *mut c_void,
                TRAMPOLINE_BLOCK,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        if !block.is_null() {
            return Ok(block.cast());
        }
        hint += ALLOCATION_GRANULE;
    }
    Err(HookError::Patch(
        "no free memory within 4 GiB above the module".to_string(),
    ))
}

/// `jmp qword ptr [rip+0]` followed by the absolute target.
unsafe fn write_trampoline(at: *mut u8, target: usize) {
    let mut code = [0u8; 14];
    code[..6].copy_from_slice(&[0xFF, 0x25, 0, 0, 0, 0]);
    code[6..].copy_from_slice(&(target as u64).to_le_bytes());
    std::ptr::copy_nonoverlapping(code.as_ptr(), at, code.len());
}

unsafe fn write_slot(slot: *mut u32, rva: u32) -> HookResult<()> {
    let mut old = 0u32;
    if VirtualProtect(slot.cast(), 4, PAGE_READWRITE, &mut old) == 0 {
        return Err(HookError::Patch(format!(
            "VirtualProtect failed with error {}",
            GetLastError()
        )));
    }
    std::ptr::write_volatile(slot, rva);
    let mut ignored = 0u32;
    VirtualProtect(slot.cast(), 4, old, &mut ignored);
    Ok(())
}

impl AllocatorHookInstaller for ExportTablePatcher {
    fn name(&self) -> &'static str {
        "export-table-patch"
    }

    fn install(&self) -> HookResult<()> {
        let mut installed = self.installed.lock();
        if installed.is_some() {
            return Err(HookError::AlreadyInstalled);
        }

        let base = self.module_base()?;
        // SAFETY: a loaded module maps at least its headers.
        let header = unsafe { std::slice::from_raw_parts(base as *const u8, HEADER_PROBE) };
        let size = PeImage::parse(header)?.size_of_image() as usize;
        // SAFETY: SizeOfImage bytes are mapped from the module base.
        let image = PeImage::parse(unsafe { std::slice::from_raw_parts(base as *const u8, size) })?;

        let mut found = Vec::new();
        for target in targets() {
            match image.find_export(target.name)? {
                Some(export) if export.forwarder.is_none() => found.push((target, export)),
                _ if target.required => {
                    return Err(HookError::SymbolNotFound {
                        symbol: target.name.to_string(),
                        reason: format!("not exported by {}", self.module),
                    });
                }
                _ => tracing::debug!("{} does not export {}", self.module, target.name),
            }
        }

        let block = alloc_near(base, size)?;
        let mut originals = OriginalEntryPoints::default();
        let mut slots = Vec::with_capacity(found.len());
        for (i, (target, export)) in found.iter().enumerate() {
            let original = base + export.rva as usize;
            // SAFETY: the addresses are the runtime's own exports with the
            // signatures named by each function type.
            unsafe {
                match target.name {
                    "cudaMalloc" => originals.malloc = Some(std::mem::transmute::<usize, MallocFn>(original)),
                    "cudaFree" => originals.free = Some(std::mem::transmute::<usize, FreeFn>(original)),
                    "cudaMallocAsync" => {
                        originals.malloc_async = Some(std::mem::transmute::<usize, MallocAsyncFn>(original));
                    }
                    _ => originals.free_async = Some(std::mem::transmute::<usize, FreeAsyncFn>(original)),
                }
            }

            // SAFETY: block has TRAMPOLINE_BLOCK writable bytes.
            let trampoline = unsafe { block.add(i * TRAMPOLINE_STRIDE) };
            unsafe { write_trampoline(trampoline, target.replacement) };
            let new_rva = u32::try_from(trampoline as usize - base)
                .map_err(|_| HookError::Patch("trampoline out of RVA range".to_string()))?;
            slots.push(PatchedSlot {
                name: target.name,
                slot: (base + export.slot_rva as usize) as *mut u32,
                original_rva: export.rva,
                patched_rva: new_rva,
            });
        }
        // SAFETY: flushing our own freshly written code.
        unsafe { FlushInstructionCache(GetCurrentProcess(), block as *const c_void, TRAMPOLINE_BLOCK) };

        router::set_originals(originals);
        for (i, slot) in slots.iter().enumerate() {
            // SAFETY: the slot lies in the module's export address table.
            if let Err(err) = unsafe { write_slot(slot.slot, slot.patched_rva) } {
                for done in &slots[..i] {
                    unsafe {
                        let _ = write_slot(done.slot, done.original_rva);
                    }
                }
                return Err(err);
            }
            tracing::debug!("patched {}!{}", self.module, slot.name);
        }

        router::set_active(true);
        *installed = Some(Installed { slots });
        tracing::debug!("hooks successfully installed in {}", self.module);
        Ok(())
    }

    fn uninstall(&self) -> HookResult<()> {
        let Some(state) = self.installed.lock().take() else {
            return Ok(());
        };
        router::set_active(false);
        let mut first_err = None;
        for slot in &state.slots {
            // SAFETY: restoring the value read at install time.
            if let Err(err) = unsafe { write_slot(slot.slot, slot.original_rva) } {
                tracing::error!("failed to restore {}!{}: {}", self.module, slot.name, err);
                first_err.get_or_insert(err);
            }
        }
        // Trampolines stay mapped: callers may still hold their addresses.
        first_err.map_or(Ok(()), Err)
    }

    fn is_installed(&self) -> bool {
        self.installed.lock().is_some()
    }
}
