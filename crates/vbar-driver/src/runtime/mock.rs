//! In-process simulated driver.
//!
//! `MockDriver` keeps the whole virtual-memory state of one or more fake
//! devices in host memory: reservations, physical allocations with a memory
//! budget, mappings, and stream-ordered allocations. Physical pages keep
//! their bytes across unmap/remap, so stale data is observable the same way
//! it is on real hardware.
//!
//! Tests can inject one-shot failures per primitive with
//! [`MockDriver::inject_failure`] and read or write single bytes through a
//! mapping with [`MockDriver::write_byte`] / [`MockDriver::read_byte`].

use super::DriverBackend;
use crate::device::{DeviceId, DeviceInfo, MemInfo};
use crate::memory::{align_up, Access, DevicePtr, PhysHandle, StreamHandle};
use crate::{DriverError, DriverErrorKind, DriverResult};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// First address handed out by the mock address space.
const MOCK_VA_BASE: u64 = 0x7f00_0000_0000;

/// Shape of one simulated device.
#[derive(Clone, Debug)]
pub struct MockDeviceConfig {
    /// Physical memory of the device.
    pub memory_total: usize,
    /// Largest single VA reservation the device accepts.
    pub max_reservation: usize,
    /// Allocation granularity.
    pub granularity: usize,
}

impl Default for MockDeviceConfig {
    fn default() -> Self {
        Self {
            memory_total: 8 << 30,
            max_reservation: 64 << 30,
            granularity: 2 << 20,
        }
    }
}

impl MockDeviceConfig {
    /// A device with `memory_total` bytes and the default reservation limit.
    #[must_use]
    pub fn with_memory(memory_total: usize) -> Self {
        Self {
            memory_total,
            ..Self::default()
        }
    }

    /// Override the largest reservation the device accepts.
    #[must_use]
    pub fn max_reservation(mut self, bytes: usize) -> Self {
        self.max_reservation = bytes;
        self
    }
}

/// Primitive selector for failure injection and call counting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MockOp {
    /// `init`
    Init,
    /// `reserve_va`
    ReserveVa,
    /// `free_va`
    FreeVa,
    /// `create_physical`
    CreatePhysical,
    /// `release_physical`
    ReleasePhysical,
    /// `map`
    Map,
    /// `unmap`
    Unmap,
    /// `set_access`
    SetAccess,
    /// `alloc_async`
    AllocAsync,
    /// `free_async`
    FreeAsync,
    /// `mem_info`
    MemInfo,
}

impl MockOp {
    const fn op_name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::ReserveVa => "reserve_va",
            Self::FreeVa => "free_va",
            Self::CreatePhysical => "create_physical",
            Self::ReleasePhysical => "release_physical",
            Self::Map => "map",
            Self::Unmap => "unmap",
            Self::SetAccess => "set_access",
            Self::AllocAsync => "alloc_async",
            Self::FreeAsync => "free_async",
            Self::MemInfo => "mem_info",
        }
    }
}

struct DeviceSlot {
    config: MockDeviceConfig,
    committed: usize,
    async_bytes: usize,
}

impl DeviceSlot {
    fn free(&self) -> usize {
        self.config
            .memory_total
            .saturating_sub(self.committed + self.async_bytes)
    }
}

struct PhysicalRecord {
    size: usize,
    device: DeviceId,
    mapped_at: Option<u64>,
    bytes: FxHashMap<usize, u8>,
}

struct MappingRecord {
    size: usize,
    handle: u64,
    access: Option<Access>,
}

#[derive(Default)]
struct MockState {
    devices: Vec<DeviceSlot>,
    current: u32,
    next_va: u64,
    next_handle: u64,
    reservations: BTreeMap<u64, usize>,
    physical: FxHashMap<u64, PhysicalRecord>,
    mappings: BTreeMap<u64, MappingRecord>,
    async_allocs: FxHashMap<u64, (u32, usize)>,
    injected: Vec<(MockOp, DriverErrorKind)>,
    calls: FxHashMap<MockOp, usize>,
}

impl MockState {
    fn enter(&mut self, op: MockOp) -> DriverResult<()> {
        *self.calls.entry(op).or_default() += 1;
        if let Some(pos) = self.injected.iter().position(|(o, _)| *o == op) {
            let (_, kind) = self.injected.remove(pos);
            return Err(DriverError::new(op.op_name(), kind, -1, "injected failure"));
        }
        Ok(())
    }

    fn slot(&self, device: DeviceId, op: &'static str) -> DriverResult<&DeviceSlot> {
        self.devices
            .get(device.0 as usize)
            .ok_or_else(|| DriverError::invalid_value(op, format!("no such device {device}")))
    }

    fn slot_mut(&mut self, device: DeviceId, op: &'static str) -> DriverResult<&mut DeviceSlot> {
        self.devices
            .get_mut(device.0 as usize)
            .ok_or_else(|| DriverError::invalid_value(op, format!("no such device {device}")))
    }

    fn take_va(&mut self, size: usize, alignment: usize) -> u64 {
        let align = alignment.max(1).next_power_of_two() as u64;
        let addr = (self.next_va + align - 1) & !(align - 1);
        self.next_va = addr + size as u64;
        addr
    }

    fn reservation_containing(&self, va: u64, size: usize) -> bool {
        self.reservations
            .range(..=va)
            .next_back()
            .is_some_and(|(&base, &len)| va + size as u64 <= base + len as u64)
    }

    fn mapping_containing(&self, va: u64) -> Option<(u64, &MappingRecord)> {
        self.mappings
            .range(..=va)
            .next_back()
            .filter(|&(&base, m)| va < base + m.size as u64)
            .map(|(&base, m)| (base, m))
    }

    fn overlaps_mapping(&self, va: u64, size: usize) -> bool {
        let end = va + size as u64;
        if self.mapping_containing(va).is_some() {
            return true;
        }
        self.mappings.range(va..end).next().is_some()
    }

    fn range_fully_mapped(&self, va: u64, size: usize) -> bool {
        let end = va + size as u64;
        let mut cursor = va;
        while cursor < end {
            match self.mapping_containing(cursor) {
                Some((base, m)) => cursor = base + m.size as u64,
                None => return false,
            }
        }
        true
    }
}

/// Simulated driver for tests and builds without a vendor backend.
pub struct MockDriver {
    state: Mutex<MockState>,
}

impl MockDriver {
    /// One device with the given shape.
    #[must_use]
    pub fn new(config: MockDeviceConfig) -> Self {
        Self::with_devices(vec![config])
    }

    /// Several devices, numbered from 0 in the given order.
    #[must_use]
    pub fn with_devices(configs: Vec<MockDeviceConfig>) -> Self {
        let devices = configs
            .into_iter()
            .map(|config| DeviceSlot {
                config,
                committed: 0,
                async_bytes: 0,
            })
            .collect();
        Self {
            state: Mutex::new(MockState {
                devices,
                next_va: MOCK_VA_BASE,
                next_handle: 1,
                ..MockState::default()
            }),
        }
    }

    /// Make the next call of `op` fail with `kind`.
    pub fn inject_failure(&self, op: MockOp, kind: DriverErrorKind) {
        self.state.lock().injected.push((op, kind));
    }

    /// Device made current by the last successful `init`.
    #[must_use]
    pub fn current_device(&self) -> DeviceId {
        DeviceId(self.state.lock().current)
    }

    /// How many times `op` has been called, including failed calls.
    #[must_use]
    pub fn calls(&self, op: MockOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Physical bytes committed on `device` through `create_physical`.
    #[must_use]
    pub fn committed_bytes(&self, device: DeviceId) -> usize {
        self.state
            .lock()
            .devices
            .get(device.0 as usize)
            .map_or(0, |d| d.committed)
    }

    /// Number of live physical allocations across all devices.
    #[must_use]
    pub fn live_physical(&self) -> usize {
        self.state.lock().physical.len()
    }

    /// Bytes currently mapped across all reservations.
    #[must_use]
    pub fn mapped_bytes(&self) -> usize {
        self.state.lock().mappings.values().map(|m| m.size).sum()
    }

    /// Bytes of VA currently reserved.
    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        self.state.lock().reservations.values().sum()
    }

    /// Whether the byte at `va` is backed by a mapping.
    #[must_use]
    pub fn is_mapped(&self, va: DevicePtr) -> bool {
        self.state.lock().mapping_containing(va.0).is_some()
    }

    /// Physical handle mapped at exactly `va`, if any.
    #[must_use]
    pub fn handle_at(&self, va: DevicePtr) -> Option<PhysHandle> {
        self.state
            .lock()
            .mappings
            .get(&va.0)
            .map(|m| PhysHandle(m.handle))
    }

    /// Store one byte through the mapping covering `va`.
    ///
    /// # Errors
    ///
    /// Fails with [`DriverErrorKind::InvalidValue`] if `va` is not mapped
    /// or the mapping was never granted write access.
    pub fn write_byte(&self, va: DevicePtr, value: u8) -> DriverResult<()> {
        let mut state = self.state.lock();
        let (base, handle, access) = state
            .mapping_containing(va.0)
            .map(|(base, m)| (base, m.handle, m.access))
            .ok_or_else(|| DriverError::invalid_value("write", format!("{va} is not mapped")))?;
        if access != Some(Access::ReadWrite) {
            return Err(DriverError::invalid_value("write", format!("{va} is not writable")));
        }
        let record = state
            .physical
            .get_mut(&handle)
            .ok_or_else(|| DriverError::invalid_value("write", "dangling mapping"))?;
        record.bytes.insert((va.0 - base) as usize, value);
        Ok(())
    }

    /// Load one byte through the mapping covering `va`.
    ///
    /// Untouched bytes read as zero.
    ///
    /// # Errors
    ///
    /// Fails with [`DriverErrorKind::InvalidValue`] if `va` is not mapped.
    pub fn read_byte(&self, va: DevicePtr) -> DriverResult<u8> {
        let state = self.state.lock();
        let (base, m) = state
            .mapping_containing(va.0)
            .ok_or_else(|| DriverError::invalid_value("read", format!("{va} is not mapped")))?;
        if m.access.is_none() {
            return Err(DriverError::invalid_value("read", format!("{va} is not accessible")));
        }
        let offset = (va.0 - base) as usize;
        Ok(state
            .physical
            .get(&m.handle)
            .and_then(|r| r.bytes.get(&offset).copied())
            .unwrap_or(0))
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new(MockDeviceConfig::default())
    }
}

impl DriverBackend for MockDriver {
    fn name(&self) -> &'static str {
        "Mock"
    }

    fn init(&self, device: DeviceId) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.enter(MockOp::Init)?;
        state.slot(device, "init")?;
        state.current = device.0;
        Ok(())
    }

    fn device_count(&self) -> DriverResult<u32> {
        Ok(u32::try_from(self.state.lock().devices.len()).unwrap_or(u32::MAX))
    }

    fn device_info(&self, device: DeviceId) -> DriverResult<DeviceInfo> {
        let state = self.state.lock();
        let slot = state.slot(device, "device_info")?;
        let mut info = DeviceInfo::mock(device, slot.config.memory_total);
        info.allocation_granularity = slot.config.granularity;
        Ok(info)
    }

    fn reserve_va(&self, size: usize, alignment: usize) -> DriverResult<DevicePtr> {
        let mut state = self.state.lock();
        state.enter(MockOp::ReserveVa)?;
        let current = DeviceId(state.current);
        let limit = state.slot(current, "reserve_va")?.config.max_reservation;
        if size == 0 {
            return Err(DriverError::invalid_value("reserve_va", "zero-sized reservation"));
        }
        if size > limit {
            return Err(DriverError::out_of_memory(
                "reserve_va",
                format!("cannot reserve {size} bytes (limit {limit})"),
            ));
        }
        let addr = state.take_va(size, alignment);
        state.reservations.insert(addr, size);
        Ok(DevicePtr(addr))
    }

    fn free_va(&self, va: DevicePtr, size: usize) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.enter(MockOp::FreeVa)?;
        match state.reservations.get(&va.0) {
            Some(&len) if len == size => {}
            _ => {
                return Err(DriverError::invalid_value(
                    "free_va",
                    format!("no reservation of {size} bytes at {va}"),
                ))
            }
        }
        if state.overlaps_mapping(va.0, size) {
            return Err(DriverError::invalid_value("free_va", "range still has mappings"));
        }
        state.reservations.remove(&va.0);
        Ok(())
    }

    fn create_physical(&self, size: usize, device: DeviceId) -> DriverResult<PhysHandle> {
        let mut state = self.state.lock();
        state.enter(MockOp::CreatePhysical)?;
        let slot = state.slot_mut(device, "create_physical")?;
        if size == 0 || size % slot.config.granularity != 0 {
            return Err(DriverError::invalid_value(
                "create_physical",
                format!("size {size} is not a multiple of the granularity"),
            ));
        }
        if size > slot.free() {
            return Err(DriverError::out_of_memory(
                "create_physical",
                format!("{size} bytes requested, {} free", slot.free()),
            ));
        }
        slot.committed += size;
        let raw = state.next_handle;
        state.next_handle += 1;
        state.physical.insert(
            raw,
            PhysicalRecord {
                size,
                device,
                mapped_at: None,
                bytes: FxHashMap::default(),
            },
        );
        Ok(PhysHandle(raw))
    }

    fn release_physical(&self, handle: PhysHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.enter(MockOp::ReleasePhysical)?;
        let record = state.physical.get(&handle.0).ok_or_else(|| {
            DriverError::invalid_value("release_physical", format!("unknown handle {handle}"))
        })?;
        if record.mapped_at.is_some() {
            return Err(DriverError::invalid_value(
                "release_physical",
                format!("{handle} is still mapped"),
            ));
        }
        let (size, device) = (record.size, record.device);
        state.physical.remove(&handle.0);
        state.slot_mut(device, "release_physical")?.committed -= size;
        Ok(())
    }

    fn map(&self, va: DevicePtr, size: usize, handle: PhysHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.enter(MockOp::Map)?;
        if !state.reservation_containing(va.0, size) {
            return Err(DriverError::invalid_value("map", format!("{va} is not reserved")));
        }
        if state.overlaps_mapping(va.0, size) {
            return Err(DriverError::invalid_value("map", format!("{va} is already mapped")));
        }
        let record = state
            .physical
            .get_mut(&handle.0)
            .ok_or_else(|| DriverError::invalid_value("map", format!("unknown handle {handle}")))?;
        if record.size != size {
            return Err(DriverError::invalid_value(
                "map",
                format!("handle size {} does not match {size}", record.size),
            ));
        }
        if record.mapped_at.is_some() {
            return Err(DriverError::invalid_value("map", format!("{handle} is already mapped")));
        }
        record.mapped_at = Some(va.0);
        state.mappings.insert(
            va.0,
            MappingRecord {
                size,
                handle: handle.0,
                access: None,
            },
        );
        Ok(())
    }

    fn unmap(&self, va: DevicePtr, size: usize) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.enter(MockOp::Unmap)?;
        let handle = match state.mappings.get(&va.0) {
            Some(m) if m.size == size => m.handle,
            _ => {
                return Err(DriverError::invalid_value(
                    "unmap",
                    format!("no mapping of {size} bytes at {va}"),
                ))
            }
        };
        state.mappings.remove(&va.0);
        if let Some(record) = state.physical.get_mut(&handle) {
            record.mapped_at = None;
        }
        Ok(())
    }

    fn set_access(
        &self,
        va: DevicePtr,
        size: usize,
        device: DeviceId,
        access: Access,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.enter(MockOp::SetAccess)?;
        state.slot(device, "set_access")?;
        if !state.range_fully_mapped(va.0, size) {
            return Err(DriverError::invalid_value(
                "set_access",
                format!("{size} bytes at {va} are not fully mapped"),
            ));
        }
        let end = va.0 + size as u64;
        let start = state.mapping_containing(va.0).map_or(va.0, |(base, _)| base);
        for (_, m) in state.mappings.range_mut(start..end) {
            m.access = Some(access);
        }
        Ok(())
    }

    fn mem_info(&self, device: DeviceId) -> DriverResult<MemInfo> {
        let mut state = self.state.lock();
        state.enter(MockOp::MemInfo)?;
        let slot = state.slot(device, "mem_info")?;
        Ok(MemInfo {
            free: slot.free(),
            total: slot.config.memory_total,
        })
    }

    fn alloc_async(&self, size: usize, _stream: StreamHandle) -> DriverResult<DevicePtr> {
        let mut state = self.state.lock();
        state.enter(MockOp::AllocAsync)?;
        let current = DeviceId(state.current);
        let slot = state.slot_mut(current, "alloc_async")?;
        let rounded = align_up(size.max(1), slot.config.granularity);
        if rounded > slot.free() {
            return Err(DriverError::out_of_memory(
                "alloc_async",
                format!("{size} bytes requested, {} free", slot.free()),
            ));
        }
        slot.async_bytes += rounded;
        let addr = state.take_va(rounded, 512);
        state.async_allocs.insert(addr, (current.0, rounded));
        Ok(DevicePtr(addr))
    }

    fn free_async(&self, ptr: DevicePtr, _stream: StreamHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.enter(MockOp::FreeAsync)?;
        let (device, size) = state.async_allocs.remove(&ptr.0).ok_or_else(|| {
            DriverError::invalid_value("free_async", format!("{ptr} was not allocated"))
        })?;
        state.slot_mut(DeviceId(device), "free_async")?.async_bytes -= size;
        Ok(())
    }

    fn synchronize(&self, device: DeviceId) -> DriverResult<()> {
        self.state.lock().slot(device, "synchronize")?;
        Ok(())
    }
}
