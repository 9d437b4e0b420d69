//! Device identity and memory information.
//!
//! # Querying a device
//!
//! ```rust,ignore
//! use vbar_driver::{native_driver, DeviceId};
//!
//! let driver = native_driver()?;
//! let info = driver.device_info(DeviceId(0))?;
//! println!("{}: {} ({} MB)", info.id, info.name, info.memory_total / 1024 / 1024);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordinal of a GPU device as seen by the vendor driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPU:{}", self.0)
    }
}

/// Which backend a device is driven by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// NVIDIA GPU (CUDA driver API).
    Cuda,
    /// AMD GPU (HIP).
    Rocm,
    /// In-process simulated device.
    Mock,
}

impl DeviceKind {
    /// Get the display name for this device kind.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cuda => "CUDA",
            Self::Rocm => "ROCm",
            Self::Mock => "Mock",
        }
    }

    /// Check if this is a real hardware device.
    #[must_use]
    pub const fn is_hardware(self) -> bool {
        matches!(self, Self::Cuda | Self::Rocm)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Static properties of a device relevant to virtual-memory management.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device identifier.
    pub id: DeviceId,
    /// Backend kind.
    pub kind: DeviceKind,
    /// Human-readable device name.
    pub name: String,
    /// Total device memory in bytes.
    pub memory_total: usize,
    /// Minimum granularity for physical allocations and mappings.
    pub allocation_granularity: usize,
}

impl DeviceInfo {
    /// Create a mock device description for testing.
    #[must_use]
    pub fn mock(id: DeviceId, memory_total: usize) -> Self {
        Self {
            id,
            kind: DeviceKind::Mock,
            name: format!("Mock GPU Device {}", id.0),
            memory_total,
            allocation_granularity: 2 * 1024 * 1024,
        }
    }

    /// Total memory in whole megabytes.
    #[must_use]
    pub const fn memory_total_mb(&self) -> usize {
        self.memory_total / (1024 * 1024)
    }
}

/// Free/total memory as reported by the driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemInfo {
    /// Bytes the driver reports as free.
    pub free: usize,
    /// Total bytes on the device.
    pub total: usize,
}

impl MemInfo {
    /// Bytes currently in use according to the driver.
    #[must_use]
    pub const fn used(&self) -> usize {
        self.total.saturating_sub(self.free)
    }
}
