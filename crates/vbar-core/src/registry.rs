//! Device engines of one process.
//!
//! The registry owns one [`DeviceEngine`] per device, created lazily on
//! first use. Call sites that only know a raw buffer handle (the C ABI)
//! resolve it through [`BufferHandle`].

use crate::config::EngineConfig;
use crate::engine::DeviceEngine;
use crate::vbar::VbarId;
use crate::{VbarError, VbarResult};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vbar_driver::{DeviceId, DriverBackend};

const ID_BITS: u32 = 48;
const ID_MASK: u64 = (1 << ID_BITS) - 1;

/// A buffer together with the device that owns it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferHandle {
    /// Owning device.
    pub device: DeviceId,
    /// Buffer id on that device.
    pub id: VbarId,
}

impl BufferHandle {
    /// Pack into a non-zero integer: device in the top 16 bits, id below.
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        ((self.device.0 as u64) << ID_BITS) | (self.id.0 & ID_MASK)
    }

    /// Inverse of [`to_raw`](Self::to_raw). Zero is never a valid handle.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        if raw & ID_MASK == 0 {
            return None;
        }
        Some(Self {
            device: DeviceId((raw >> ID_BITS) as u32),
            id: VbarId(raw & ID_MASK),
        })
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.id)
    }
}

/// Owner of every [`DeviceEngine`] in the process.
pub struct EngineRegistry {
    driver: Arc<dyn DriverBackend>,
    config: EngineConfig,
    engines: RwLock<FxHashMap<DeviceId, Arc<DeviceEngine>>>,
    shut_down: AtomicBool,
}

impl EngineRegistry {
    /// Create an empty registry.
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::Config`] if `config` is invalid.
    pub fn new(driver: Arc<dyn DriverBackend>, config: EngineConfig) -> VbarResult<Self> {
        config.validate()?;
        Ok(Self {
            driver,
            config,
            engines: RwLock::new(FxHashMap::default()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// The engine of `device`, created on first use.
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::UnknownDevice`] if the driver has no such
    /// device, or the initialization failure.
    pub fn engine(&self, device: DeviceId) -> VbarResult<Arc<DeviceEngine>> {
        if let Some(engine) = self.get(device) {
            return Ok(engine);
        }
        if self.shut_down.load(Ordering::Acquire) {
            return Err(VbarError::ShutDown);
        }
        if device.0 >= self.driver.device_count()? {
            return Err(VbarError::UnknownDevice(device));
        }

        let mut engines = self.engines.write();
        if let Some(engine) = engines.get(&device) {
            return Ok(Arc::clone(engine));
        }
        let engine = Arc::new(DeviceEngine::new(
            Arc::clone(&self.driver),
            device,
            self.config.clone(),
        )?);
        engines.insert(device, Arc::clone(&engine));
        Ok(engine)
    }

    /// The engine of `device` if one exists.
    #[must_use]
    pub fn get(&self, device: DeviceId) -> Option<Arc<DeviceEngine>> {
        self.engines.read().get(&device).cloned()
    }

    /// Engine owning `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::UnknownDevice`] if no engine exists for the
    /// handle's device.
    pub fn engine_for(&self, handle: BufferHandle) -> VbarResult<Arc<DeviceEngine>> {
        self.get(handle.device)
            .ok_or(VbarError::UnknownDevice(handle.device))
    }

    /// Create a VBAR on `device`.
    ///
    /// # Errors
    ///
    /// See [`DeviceEngine::create`].
    pub fn create(&self, device: DeviceId, size: usize) -> VbarResult<BufferHandle> {
        let id = self.engine(device)?.create(size)?;
        Ok(BufferHandle { device, id })
    }

    /// All engines, ordered by device.
    #[must_use]
    pub fn engines(&self) -> Vec<Arc<DeviceEngine>> {
        let mut engines: Vec<_> = self.engines.read().values().cloned().collect();
        engines.sort_by_key(|e| e.device());
        engines
    }

    /// Clear the watermark of every VBAR on every device.
    pub fn reset_watermark_limits(&self) {
        for engine in self.engines() {
            engine.reset_watermark_limits();
        }
    }

    /// Free device memory on `device` for use outside the engine. Returns
    /// the bytes released to the driver (0 if the device has no engine).
    ///
    /// # Errors
    ///
    /// See [`DeviceEngine::reclaim`].
    pub fn reclaim(&self, device: DeviceId, bytes_target: usize) -> VbarResult<usize> {
        match self.get(device) {
            Some(engine) => engine.reclaim(bytes_target),
            None => Ok(0),
        }
    }

    /// Resident bytes across all devices.
    #[must_use]
    pub fn resident_bytes(&self) -> usize {
        self.engines().iter().map(|e| e.resident_bytes()).sum()
    }

    /// Shut every engine down and refuse new ones.
    ///
    /// # Errors
    ///
    /// Returns the first failure; every engine is still shut down.
    pub fn shutdown(&self) -> VbarResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let engines: Vec<_> = self.engines.write().drain().map(|(_, e)| e).collect();
        let mut first_err = None;
        for engine in engines {
            if let Err(err) = engine.shutdown() {
                tracing::error!(device = %engine.device(), "engine shutdown failed: {}", err);
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Whether [`shutdown`](Self::shutdown) ran.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Shared driver.
    #[must_use]
    pub fn driver(&self) -> &Arc<dyn DriverBackend> {
        &self.driver
    }

    /// Configuration handed to each engine.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vbar_driver::{MockDeviceConfig, MockDriver};

    const PAGE: usize = 32 << 20;

    fn registry() -> (Arc<MockDriver>, EngineRegistry) {
        let driver = Arc::new(MockDriver::with_devices(vec![
            MockDeviceConfig::with_memory(1 << 30),
            MockDeviceConfig::with_memory(1 << 30),
        ]));
        let registry = EngineRegistry::new(driver.clone(), EngineConfig::default()).unwrap();
        (driver, registry)
    }

    #[test]
    fn test_handle_round_trip() {
        let handle = BufferHandle {
            device: DeviceId(3),
            id: VbarId(17),
        };
        assert_eq!(BufferHandle::from_raw(handle.to_raw()), Some(handle));
        assert_eq!(BufferHandle::from_raw(0), None);
        assert_eq!(handle.to_string(), "GPU:3/vbar#17");
    }

    #[test]
    fn test_engines_are_created_lazily() {
        let (_driver, registry) = registry();
        assert!(registry.get(DeviceId(1)).is_none());
        let a = registry.engine(DeviceId(1)).unwrap();
        let b = registry.engine(DeviceId(1)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(matches!(
            registry.engine(DeviceId(5)),
            Err(VbarError::UnknownDevice(DeviceId(5)))
        ));
    }

    #[test]
    fn test_reset_watermarks_on_all_devices() {
        let (_driver, registry) = registry();
        let a = registry.create(DeviceId(0), 2 * PAGE).unwrap();
        let b = registry.create(DeviceId(1), 2 * PAGE).unwrap();
        registry.engine_for(a).unwrap().set_watermark_limit(a.id, PAGE).unwrap();
        registry.engine_for(b).unwrap().set_watermark_limit(b.id, PAGE).unwrap();
        registry.reset_watermark_limits();
        assert_eq!(registry.engine_for(a).unwrap().info(a.id).unwrap().watermark_limit, 0);
        assert_eq!(registry.engine_for(b).unwrap().info(b.id).unwrap().watermark_limit, 0);
    }

    #[test]
    fn test_shutdown_releases_and_refuses() {
        let (driver, registry) = registry();
        let h = registry.create(DeviceId(0), 2 * PAGE).unwrap();
        registry.engine_for(h).unwrap().fault(h.id, 0, PAGE).unwrap();
        registry.shutdown().unwrap();
        assert_eq!(driver.reserved_bytes(), 0);
        assert_eq!(driver.live_physical(), 0);
        assert!(matches!(registry.engine(DeviceId(0)), Err(VbarError::ShutDown)));
        registry.shutdown().unwrap();
    }

    #[test]
    fn test_reclaim_without_engine() {
        let (_driver, registry) = registry();
        assert_eq!(registry.reclaim(DeviceId(1), PAGE).unwrap(), 0);
    }
}
