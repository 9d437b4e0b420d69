//! Symbol interposition on POSIX systems.
//!
//! With the `interpose` feature, the shared object exports `cudaMalloc`,
//! `cudaFree`, `cudaMallocAsync` and `cudaFreeAsync`. Loaded ahead of the
//! CUDA runtime, these definitions win symbol resolution; the runtime's
//! own implementations are then looked up with `dlsym(RTLD_NEXT, ...)`.
//!
//! Interposition cannot be undone once the dynamic linker has bound the
//! symbols, so [`PosixInterposer::uninstall`] only switches routing off:
//! the exported functions keep forwarding to the originals.

use crate::router::{self, FreeAsyncFn, FreeFn, MallocAsyncFn, MallocFn, OriginalEntryPoints};
use crate::{AllocatorHookInstaller, HookError, HookResult};
use std::ffi::{c_void, CStr, CString};
use std::sync::atomic::{AtomicBool, Ordering};

/// Resolve `symbol` in the objects loaded after this one.
fn next_symbol(symbol: &str) -> HookResult<*mut c_void> {
    let name = CString::new(symbol).map_err(|_| HookError::SymbolNotFound {
        symbol: symbol.to_string(),
        reason: "name contains a NUL byte".to_string(),
    })?;
    // SAFETY: name is a valid C string; RTLD_NEXT is a pseudo-handle.
    let ptr = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if ptr.is_null() {
        return Err(HookError::SymbolNotFound {
            symbol: symbol.to_string(),
            reason: last_dl_error(),
        });
    }
    Ok(ptr)
}

fn last_dl_error() -> String {
    // SAFETY: dlerror returns null or a thread-local C string.
    unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            "not defined by any later object".to_string()
        } else {
            CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    }
}

/// Capture the originals of all four entry points.
///
/// The async pair is required; the synchronous pair is optional.
fn resolve_originals() -> HookResult<OriginalEntryPoints> {
    let malloc_async = next_symbol("cudaMallocAsync")?;
    let free_async = next_symbol("cudaFreeAsync")?;
    let malloc = next_symbol("cudaMalloc").ok();
    let free = next_symbol("cudaFree").ok();

    // SAFETY: each address was exported under the name whose C signature the
    // target type spells out.
    unsafe {
        Ok(OriginalEntryPoints {
            malloc_async: Some(std::mem::transmute::<*mut c_void, MallocAsyncFn>(malloc_async)),
            free_async: Some(std::mem::transmute::<*mut c_void, FreeAsyncFn>(free_async)),
            malloc: malloc.map(|p| std::mem::transmute::<*mut c_void, MallocFn>(p)),
            free: free.map(|p| std::mem::transmute::<*mut c_void, FreeFn>(p)),
        })
    }
}

/// Installer backed by dynamic-linker interposition.
#[derive(Debug, Default)]
pub struct PosixInterposer {
    installed: AtomicBool,
}

impl PosixInterposer {
    /// A fresh, uninstalled interposer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            installed: AtomicBool::new(false),
        }
    }
}

impl AllocatorHookInstaller for PosixInterposer {
    fn name(&self) -> &'static str {
        "dlsym-interpose"
    }

    fn install(&self) -> HookResult<()> {
        if self.installed.load(Ordering::Acquire) {
            return Err(HookError::AlreadyInstalled);
        }
        let originals = resolve_originals().map_err(|err| {
            tracing::error!("failed to find the real runtime allocation symbols: {}", err);
            err
        })?;
        router::set_originals(originals);
        router::set_active(true);
        self.installed.store(true, Ordering::Release);
        tracing::debug!("runtime allocation symbols resolved");
        Ok(())
    }

    fn uninstall(&self) -> HookResult<()> {
        if self.installed.swap(false, Ordering::AcqRel) {
            router::set_active(false);
            tracing::debug!("allocation routing disabled");
        }
        Ok(())
    }

    fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }
}

/// The exported replacements. Calls arriving before `install` forward to
/// lazily resolved originals.
#[cfg(all(feature = "interpose", not(feature = "rocm")))]
#[allow(non_snake_case)]
mod exports {
    use super::resolve_originals;
    use crate::router;
    use std::ffi::{c_int, c_void};

    fn ensure_originals() {
        if router::originals().is_empty() {
            if let Ok(originals) = resolve_originals() {
                router::set_originals(originals);
            }
        }
    }

    /// # Safety
    ///
    /// Same contract as the CUDA runtime's `cudaMallocAsync`.
    #[no_mangle]
    pub unsafe extern "C" fn cudaMallocAsync(
        out: *mut *mut c_void,
        size: usize,
        stream: *mut c_void,
    ) -> c_int {
        ensure_originals();
        router::hooked_malloc_async(out, size, stream)
    }

    /// # Safety
    ///
    /// Same contract as the CUDA runtime's `cudaFreeAsync`.
    #[no_mangle]
    pub unsafe extern "C" fn cudaFreeAsync(ptr: *mut c_void, stream: *mut c_void) -> c_int {
        ensure_originals();
        router::hooked_free_async(ptr, stream)
    }

    /// # Safety
    ///
    /// Same contract as the CUDA runtime's `cudaMalloc`.
    #[no_mangle]
    pub unsafe extern "C" fn cudaMalloc(out: *mut *mut c_void, size: usize) -> c_int {
        ensure_originals();
        router::hooked_malloc(out, size)
    }

    /// # Safety
    ///
    /// Same contract as the CUDA runtime's `cudaFree`.
    #[no_mangle]
    pub unsafe extern "C" fn cudaFree(ptr: *mut c_void) -> c_int {
        ensure_originals();
        router::hooked_free(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_symbol_is_reported() {
        let err = next_symbol("vbar_symbol_that_does_not_exist").unwrap_err();
        assert!(matches!(err, HookError::SymbolNotFound { ref symbol, .. } if symbol == "vbar_symbol_that_does_not_exist"));
    }

    #[test]
    fn test_libc_symbol_resolves() {
        assert!(next_symbol("malloc").is_ok());
    }

    #[test]
    fn test_install_without_runtime_fails_cleanly() {
        let _guard = router::TEST_LOCK.lock();
        let interposer = PosixInterposer::new();
        if interposer.install().is_err() {
            assert!(!interposer.is_installed());
            assert!(!router::is_active());
        } else {
            // A CUDA runtime is present on this machine.
            interposer.uninstall().unwrap();
            assert!(!router::is_active());
        }
        interposer.uninstall().unwrap();
    }
}
