//! # VBAR Allocation Hooks
//!
//! Keeps allocations made through the vendor runtime's standard entry
//! points (`cudaMalloc`, `cudaFree`, `cudaMallocAsync`, `cudaFreeAsync`)
//! visible to the same memory budget as the VBAR engine.
//!
//! ## Overview
//!
//! An [`AllocatorHookInstaller`] redirects the entry points to the
//! functions in [`router`], which forward to whatever
//! [`AllocationRouter`] the host registered and fall back to the original
//! implementation otherwise. Originals stay callable through
//! [`router::originals`].
//!
//! | Platform | Installer | Mechanism |
//! |----------|-----------|-----------|
//! | Linux and other POSIX | [`interpose::PosixInterposer`] | symbols exported from this shared object, originals via `dlsym(RTLD_NEXT)` |
//! | Windows | `eat::ExportTablePatcher` | export-address-table entries of the runtime DLL redirected through trampolines |
//! | anything else | [`NoopHookInstaller`] | nothing is redirected |
//!
//! Only the CUDA runtime is redirected. A build with the `rocm` feature
//! uses [`NoopHookInstaller`] everywhere: HIP allocations bypass the engine
//! and are seen only through the device's free-memory figure.
//!
//! [`device_identity`] carries the companion LUID query used by runtimes
//! that cannot report an adapter LUID themselves. [`pe`] parses export
//! directories of PE images and is platform-independent.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod device_identity;
pub mod pe;
pub mod router;

#[cfg(unix)]
pub mod interpose;

#[cfg(windows)]
pub mod eat;

use thiserror::Error;
use vbar_driver::DeviceKind;

pub use router::{AllocationRouter, FreeDisposition};

/// Errors produced while installing or removing hooks.
#[derive(Debug, Error)]
pub enum HookError {
    /// The runtime library is not loaded and could not be loaded.
    #[error("library {library} not available: {reason}")]
    LibraryNotFound {
        /// Library name.
        library: String,
        /// Loader message.
        reason: String,
    },

    /// A required symbol is missing.
    #[error("symbol {symbol} not found: {reason}")]
    SymbolNotFound {
        /// Symbol name.
        symbol: String,
        /// Loader message.
        reason: String,
    },

    /// A PE image could not be parsed.
    #[error("malformed image: {0}")]
    MalformedImage(String),

    /// Patching process memory failed.
    #[error("patch failed: {0}")]
    Patch(String),

    /// `install` was called twice.
    #[error("hooks are already installed")]
    AlreadyInstalled,

    /// The operation has no implementation on this platform.
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

/// Result type for hook operations.
pub type HookResult<T> = Result<T, HookError>;

/// Redirects the runtime's allocation entry points for the whole process.
pub trait AllocatorHookInstaller: Send + Sync {
    /// Human-readable mechanism name.
    fn name(&self) -> &'static str;

    /// Redirect the entry points. Fails without side effects.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime or one of its entry points cannot be
    /// found, or memory could not be patched.
    fn install(&self) -> HookResult<()>;

    /// Restore the original entry points. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if memory could not be restored.
    fn uninstall(&self) -> HookResult<()>;

    /// Whether `install` succeeded and `uninstall` has not run since.
    fn is_installed(&self) -> bool;
}

/// Installer for platforms without a hooking mechanism.
#[derive(Debug, Default)]
pub struct NoopHookInstaller;

impl AllocatorHookInstaller for NoopHookInstaller {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn install(&self) -> HookResult<()> {
        tracing::debug!("allocation hooks are not available on this platform");
        Ok(())
    }

    fn uninstall(&self) -> HookResult<()> {
        Ok(())
    }

    fn is_installed(&self) -> bool {
        false
    }
}

/// Vendor runtime whose entry points this build redirects.
pub const HOOKED_RUNTIME: DeviceKind = if cfg!(feature = "rocm") {
    DeviceKind::Rocm
} else {
    DeviceKind::Cuda
};

/// The installer for `runtime` on the current platform.
#[must_use]
pub fn installer_for(runtime: DeviceKind) -> Box<dyn AllocatorHookInstaller> {
    match runtime {
        DeviceKind::Cuda => cuda_installer(),
        DeviceKind::Rocm | DeviceKind::Mock => Box::new(NoopHookInstaller),
    }
}

/// The installer for the runtime compiled into this build.
#[must_use]
pub fn platform_installer() -> Box<dyn AllocatorHookInstaller> {
    installer_for(HOOKED_RUNTIME)
}

fn cuda_installer() -> Box<dyn AllocatorHookInstaller> {
    #[cfg(unix)]
    {
        Box::new(interpose::PosixInterposer::new())
    }
    #[cfg(windows)]
    {
        Box::new(eat::ExportTablePatcher::cuda_runtime())
    }
    #[cfg(not(any(unix, windows)))]
    {
        Box::new(NoopHookInstaller)
    }
}
