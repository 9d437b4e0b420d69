//! Zero-copy views of device memory.
//!
//! Frameworks wrap foreign device memory as tensors through a small
//! descriptor; [`ExternalBufferView::array_interface`] produces the
//! `__cuda_array_interface__` (version 3) form of it, a one-dimensional
//! byte array.

use crate::{HostError, HostResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use vbar_core::{DeviceEngine, VbarId};
use vbar_driver::{DeviceId, DevicePtr};

/// Device memory exposed without copying.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalBufferView {
    /// First byte.
    pub pointer: DevicePtr,
    /// Length in bytes.
    pub byte_length: usize,
    /// Device holding the memory.
    pub device: DeviceId,
    /// Whether consumers may write through the view.
    pub mutable: bool,
}

impl ExternalBufferView {
    /// A writable view.
    #[must_use]
    pub const fn new(pointer: DevicePtr, byte_length: usize, device: DeviceId) -> Self {
        Self {
            pointer,
            byte_length,
            device,
            mutable: true,
        }
    }

    /// View of `length` bytes at `offset` inside a VBAR.
    ///
    /// Nothing is made resident; the caller faults the range before the
    /// consumer touches it.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::ViewOutOfBounds`] if the range leaves the
    /// buffer, or the engine error for an unknown buffer.
    pub fn of_range(
        engine: &DeviceEngine,
        id: VbarId,
        offset: usize,
        length: usize,
    ) -> HostResult<Self> {
        let capacity = engine.capacity(id)?;
        if offset.checked_add(length).map_or(true, |end| end > capacity) {
            return Err(HostError::ViewOutOfBounds {
                offset,
                length,
                capacity,
            });
        }
        let base = engine.base(id)?;
        Ok(Self::new(base.offset(offset), length, engine.device()))
    }

    /// The same view, read-only.
    #[must_use]
    pub const fn read_only(self) -> Self {
        Self {
            mutable: false,
            ..self
        }
    }

    /// `__cuda_array_interface__` dictionary of the view.
    #[must_use]
    pub fn array_interface(&self) -> Value {
        json!({
            "shape": [self.byte_length],
            "typestr": "|u1",
            "data": [self.pointer.as_raw(), !self.mutable],
            "strides": Value::Null,
            "version": 3,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vbar_core::EngineConfig;
    use vbar_driver::{MockDeviceConfig, MockDriver};

    #[test]
    fn test_array_interface() {
        let view = ExternalBufferView::new(DevicePtr::from_raw(0x7f00_0000_0200), 4096, DeviceId(0));
        let iface = view.array_interface();
        assert_eq!(iface["shape"], json!([4096]));
        assert_eq!(iface["typestr"], "|u1");
        assert_eq!(iface["data"], json!([0x7f00_0000_0200_u64, false]));
        assert!(iface["strides"].is_null());
        assert_eq!(iface["version"], 3);

        let frozen = view.read_only().array_interface();
        assert_eq!(frozen["data"][1], true);
    }

    #[test]
    fn test_view_of_range() {
        let driver = Arc::new(MockDriver::new(MockDeviceConfig::with_memory(1 << 30)));
        let engine = DeviceEngine::new(driver, DeviceId(0), EngineConfig::default()).unwrap();
        let id = engine.create(256 << 20).unwrap();
        let alloc = engine.alloc(id, 1000).unwrap();

        let view = ExternalBufferView::of_range(&engine, id, alloc.offset, alloc.size).unwrap();
        assert_eq!(view.pointer, engine.base(id).unwrap().offset(alloc.offset));
        assert_eq!(view.byte_length, 1000);
        assert!(view.mutable);

        assert!(matches!(
            ExternalBufferView::of_range(&engine, id, 255 << 20, 2 << 20),
            Err(HostError::ViewOutOfBounds { .. })
        ));
        assert!(ExternalBufferView::of_range(&engine, id, usize::MAX, 2).is_err());
    }
}
