//! # VBAR Engine
//!
//! Virtual-buffer regions whose physical backing is attached and detached
//! on demand, so a process can address more model-weight bytes than fit in
//! VRAM.
//!
//! ## Overview
//!
//! A VBAR is a reserved device virtual-address range cut into fixed-size
//! pages (32 MiB by default). Each page is either *resident* (a physical
//! page is mapped behind it) or *absent* (address reserved, nothing mapped).
//! Callers follow an explicit protocol instead of relying on hardware page
//! faults:
//!
//! 1. [`DeviceEngine::alloc`] hands out a stable offset (virtual only).
//! 2. [`DeviceEngine::fault`] makes a range resident and pins it, returning a
//!    [`Signature`] of per-page generations, or
//!    [`FaultOutcome::NotResident`] when the budget cannot admit the range.
//! 3. The caller compares the signature with the one it saved when it last
//!    uploaded data; any difference means the contents must be reloaded.
//! 4. [`DeviceEngine::unpin`] makes the pages evictable again.
//!
//! Eviction is driven by watermark limits, by pool shortage and by host
//! pressure. It walks buffers in ascending priority and never touches pinned
//! pages.
//!
//! ## Architecture
//!
//! ```text
//!   EngineRegistry ── one DeviceEngine per device
//!                        │
//!                        ├── VirtualBuffer (residency table, pins, cursor)
//!                        ├── PriorityList  (eviction order)
//!                        └── PhysicalPool  (free list, budget)
//!                                 │
//!                          Arc<dyn DriverBackend>
//! ```
//!
//! All mutable state of a device sits behind one lock, so faults on
//! different buffers of the same device serialize while different devices
//! proceed independently.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod engine;
pub mod log_once;
pub mod page;
pub mod pool;
pub mod priority;
pub mod registry;
pub mod signature;
pub mod stats;
pub mod vbar;
pub mod vrambuf;

use thiserror::Error;
use vbar_driver::{DeviceId, DriverError};

pub use config::EngineConfig;
pub use engine::{DeviceEngine, FaultOutcome};
pub use log_once::LogOnce;
pub use pool::{PageOwner, PhysicalPool, PoolStats};
pub use registry::{BufferHandle, EngineRegistry};
pub use signature::Signature;
pub use stats::{EngineStats, StatsSnapshot};
pub use vbar::{Allocation, VbarId, VbarInfo};
pub use vrambuf::VramBuffer;

/// Errors produced by the engine.
#[derive(Debug, Error)]
pub enum VbarError {
    /// Not even one page of virtual address space could be reserved.
    #[error("could not reserve virtual address space for {requested} bytes: {source}")]
    ReservationFailure {
        /// Bytes originally requested.
        requested: usize,
        /// Last driver failure.
        #[source]
        source: DriverError,
    },

    /// The physical budget cannot admit another page.
    #[error("physical budget exceeded: requested {requested} bytes, available {available} bytes")]
    BudgetExceeded {
        /// Requested size.
        requested: usize,
        /// Bytes still admissible.
        available: usize,
    },

    /// A driver primitive failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// A range falls outside the buffer.
    #[error("range {offset:#x}+{size:#x} is outside a buffer of {capacity:#x} bytes")]
    InvalidRange {
        /// Range start.
        offset: usize,
        /// Range length.
        size: usize,
        /// Buffer capacity.
        capacity: usize,
    },

    /// The bump allocator ran past the buffer capacity.
    #[error("buffer address space exhausted: requested {requested} bytes, {remaining} bytes left")]
    OutOfVirtualSpace {
        /// Requested size.
        requested: usize,
        /// Bytes left after alignment.
        remaining: usize,
    },

    /// The buffer does not exist on this device.
    #[error("unknown buffer: {0}")]
    UnknownBuffer(VbarId),

    /// The device has no engine.
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    /// The registry was shut down.
    #[error("engine has been shut down")]
    ShutDown,

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Configuration file could not be parsed.
    #[error("configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bookkeeping disagreement (should not occur in correct usage).
    #[error("internal engine error: {0}")]
    Internal(String),
}

impl VbarError {
    /// Whether the caller can recover by retrying differently.
    ///
    /// Reservation failures are recoverable with a smaller request and
    /// budget exhaustion by evicting or waiting; everything else is fatal
    /// for the operation.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ReservationFailure { .. } | Self::BudgetExceeded { .. }
        )
    }
}

/// Result type for engine operations.
pub type VbarResult<T> = Result<T, VbarError>;
