//! Growable contiguous VRAM buffer.
//!
//! Unlike a VBAR, a `VramBuffer` never evicts: it reserves `max_size` of VA
//! once and maps physical chunks behind it front to back as the caller
//! asks for more room. Useful for scratch space whose final size is not
//! known up front but must stay at one address.

use crate::{VbarError, VbarResult};
use std::sync::Arc;
use vbar_driver::{align_up, Access, DeviceId, DevicePtr, DriverBackend, PhysHandle};

/// A VA reservation backed by physical chunks up to a high-water mark.
pub struct VramBuffer {
    driver: Arc<dyn DriverBackend>,
    device: DeviceId,
    base: DevicePtr,
    max_size: usize,
    chunk_size: usize,
    chunks: Vec<PhysHandle>,
    externally_reserved: bool,
    torn_down: bool,
}

impl VramBuffer {
    /// Reserve `max_size` bytes (rounded up to whole chunks), or adopt
    /// `pre_reserved` if given. An adopted range of `max_size` bytes is
    /// rounded down to whole chunks instead. Nothing is mapped yet.
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::Config`] if `chunk_size` is not a multiple of the
    /// device granularity or an adopted range holds no whole chunk, or
    /// [`VbarError::ReservationFailure`] if the reservation failed.
    pub fn create(
        driver: Arc<dyn DriverBackend>,
        device: DeviceId,
        max_size: usize,
        chunk_size: usize,
        pre_reserved: Option<DevicePtr>,
    ) -> VbarResult<Self> {
        let granularity = driver.device_info(device)?.allocation_granularity.max(1);
        if chunk_size == 0 || chunk_size % granularity != 0 {
            return Err(VbarError::Config(format!(
                "chunk size {chunk_size} is not a multiple of the {granularity} byte granularity"
            )));
        }
        let (base, max_size, externally_reserved) = match pre_reserved {
            Some(base) if !base.is_null() => {
                // The caller owns the range: never map past its end.
                let max_size = max_size - max_size % chunk_size;
                if max_size == 0 {
                    return Err(VbarError::Config(format!(
                        "reserved range is smaller than one {chunk_size} byte chunk"
                    )));
                }
                (base, max_size, true)
            }
            _ => {
                let max_size = align_up(max_size.max(1), chunk_size);
                let base = driver
                    .reserve_va(max_size, chunk_size)
                    .map_err(|source| VbarError::ReservationFailure {
                        requested: max_size,
                        source,
                    })?;
                (base, max_size, false)
            }
        };
        tracing::debug!(device = %device, base = %base, max_size, "created VRAM buffer");
        Ok(Self {
            driver,
            device,
            base,
            max_size,
            chunk_size,
            chunks: Vec::new(),
            externally_reserved,
            torn_down: false,
        })
    }

    /// Map chunks until at least `required` bytes are backed.
    ///
    /// Returns `Ok(false)` if `required` exceeds the reservation or the
    /// device is out of memory; chunks mapped so far stay mapped.
    ///
    /// # Errors
    ///
    /// Returns any driver failure other than out-of-memory.
    pub fn grow(&mut self, required: usize) -> VbarResult<bool> {
        if required > self.max_size {
            return Ok(false);
        }
        while self.mapped_size() < required {
            let handle = match self.driver.create_physical(self.chunk_size, self.device) {
                Ok(handle) => handle,
                Err(err) if err.is_out_of_memory() => {
                    tracing::warn!(device = %self.device, required, "VRAM buffer cannot grow: {}", err);
                    return Ok(false);
                }
                Err(err) => return Err(err.into()),
            };
            let va = self.base.offset(self.mapped_size());
            if let Err(err) = self.driver.map(va, self.chunk_size, handle) {
                self.release_quietly(handle);
                return Err(err.into());
            }
            if let Err(err) = self
                .driver
                .set_access(va, self.chunk_size, self.device, Access::ReadWrite)
            {
                if self.driver.unmap(va, self.chunk_size).is_ok() {
                    self.release_quietly(handle);
                }
                return Err(err.into());
            }
            self.chunks.push(handle);
        }
        Ok(true)
    }

    fn release_quietly(&self, handle: PhysHandle) {
        if let Err(err) = self.driver.release_physical(handle) {
            tracing::warn!("failed to release chunk {}: {}", handle, err);
        }
    }

    /// First byte of the buffer.
    #[must_use]
    pub const fn base(&self) -> DevicePtr {
        self.base
    }

    /// Bytes currently backed by physical memory.
    #[must_use]
    pub fn mapped_size(&self) -> usize {
        self.chunks.len() * self.chunk_size
    }

    /// Reserved bytes.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// Owning device.
    #[must_use]
    pub const fn device(&self) -> DeviceId {
        self.device
    }

    /// Unmap and release every chunk, then free the reservation unless it
    /// was supplied by the caller.
    ///
    /// # Errors
    ///
    /// Returns the first driver failure.
    pub fn destroy(mut self) -> VbarResult<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> VbarResult<()> {
        self.torn_down = true;
        let mut first_err = None;
        let mut still_mapped = false;
        for (i, handle) in std::mem::take(&mut self.chunks).into_iter().enumerate() {
            let va = self.base.offset(i * self.chunk_size);
            match self.driver.unmap(va, self.chunk_size) {
                Ok(()) => {
                    if let Err(err) = self.driver.release_physical(handle) {
                        first_err.get_or_insert(err);
                    }
                }
                Err(err) => {
                    still_mapped = true;
                    first_err.get_or_insert(err);
                }
            }
        }
        if !self.externally_reserved && !still_mapped {
            if let Err(err) = self.driver.free_va(self.base, self.max_size) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), |err| Err(err.into()))
    }
}

impl Drop for VramBuffer {
    fn drop(&mut self) {
        if !self.torn_down {
            if let Err(err) = self.teardown() {
                tracing::warn!(device = %self.device, "VRAM buffer teardown failed: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vbar_driver::{DriverErrorKind, MockDeviceConfig, MockDriver, MockOp};

    const MIB: usize = 1 << 20;

    fn driver(memory: usize) -> Arc<MockDriver> {
        Arc::new(MockDriver::new(MockDeviceConfig::with_memory(memory)))
    }

    #[test]
    fn test_grow_maps_whole_chunks() {
        let driver = driver(256 * MIB);
        let mut buf = VramBuffer::create(driver.clone(), DeviceId(0), 64 * MIB, 8 * MIB, None).unwrap();
        assert_eq!(buf.mapped_size(), 0);
        assert!(buf.grow(10 * MIB).unwrap());
        assert_eq!(buf.mapped_size(), 16 * MIB);
        assert!(buf.grow(4 * MIB).unwrap());
        assert_eq!(driver.calls(MockOp::CreatePhysical), 2);
        assert!(driver.is_mapped(buf.base().offset(15 * MIB)));
        driver.write_byte(buf.base().offset(MIB), 7).unwrap();
    }

    #[test]
    fn test_grow_past_reservation_fails() {
        let driver = driver(256 * MIB);
        let mut buf = VramBuffer::create(driver, DeviceId(0), 16 * MIB, 8 * MIB, None).unwrap();
        assert!(!buf.grow(17 * MIB).unwrap());
        assert_eq!(buf.mapped_size(), 0);
    }

    #[test]
    fn test_grow_stops_on_oom() {
        let driver = driver(16 * MIB);
        let mut buf = VramBuffer::create(driver, DeviceId(0), 64 * MIB, 8 * MIB, None).unwrap();
        assert!(!buf.grow(32 * MIB).unwrap());
        assert_eq!(buf.mapped_size(), 16 * MIB);
    }

    #[test]
    fn test_grow_map_failure_releases_chunk() {
        let driver = driver(256 * MIB);
        let mut buf = VramBuffer::create(driver.clone(), DeviceId(0), 64 * MIB, 8 * MIB, None).unwrap();
        driver.inject_failure(MockOp::Map, DriverErrorKind::Other);
        assert!(buf.grow(8 * MIB).is_err());
        assert_eq!(driver.live_physical(), 0);
    }

    #[test]
    fn test_destroy_frees_everything() {
        let driver = driver(256 * MIB);
        let mut buf = VramBuffer::create(driver.clone(), DeviceId(0), 64 * MIB, 8 * MIB, None).unwrap();
        buf.grow(24 * MIB).unwrap();
        buf.destroy().unwrap();
        assert_eq!(driver.live_physical(), 0);
        assert_eq!(driver.reserved_bytes(), 0);
    }

    #[test]
    fn test_pre_reserved_range_is_kept() {
        let driver = driver(256 * MIB);
        let base = driver.reserve_va(32 * MIB, 8 * MIB).unwrap();
        {
            let mut buf =
                VramBuffer::create(driver.clone(), DeviceId(0), 32 * MIB, 8 * MIB, Some(base)).unwrap();
            assert_eq!(buf.base(), base);
            buf.grow(8 * MIB).unwrap();
        }
        assert_eq!(driver.live_physical(), 0);
        assert_eq!(driver.reserved_bytes(), 32 * MIB);
    }

    #[test]
    fn test_pre_reserved_size_rounds_down() {
        let driver = driver(256 * MIB);
        let base = driver.reserve_va(20 * MIB, 2 * MIB).unwrap();
        let mut buf =
            VramBuffer::create(driver.clone(), DeviceId(0), 20 * MIB, 8 * MIB, Some(base)).unwrap();
        assert_eq!(buf.max_size(), 16 * MIB);
        assert!(!buf.grow(17 * MIB).unwrap());
        assert!(buf.grow(16 * MIB).unwrap());
        assert!(!driver.is_mapped(base.offset(16 * MIB)));
        assert!(matches!(
            VramBuffer::create(driver, DeviceId(0), 4 * MIB, 8 * MIB, Some(base.offset(16 * MIB))),
            Err(VbarError::Config(_))
        ));
    }

    #[test]
    fn test_chunk_must_match_granularity() {
        let driver = driver(256 * MIB);
        assert!(matches!(
            VramBuffer::create(driver, DeviceId(0), 64 * MIB, MIB, None),
            Err(VbarError::Config(_))
        ));
    }
}
