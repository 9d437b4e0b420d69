//! The per-device VBAR engine.
//!
//! # Fault protocol
//!
//! ```text
//!  fault(range) ──► pin pages ──► all resident? ── yes ──► Signature
//!                                     │ no
//!                                     ▼
//!                       watermark room? (sweep this VBAR)
//!                       device room?    (sweep device)
//!                                     │
//!                                     ▼
//!               per missing page: acquire (sweep on shortage) → map
//!                                     │
//!                    ┌────────────────┴───────────────┐
//!                    ▼                                ▼
//!               Signature                  NotResident (pins undone)
//! ```
//!
//! # Eviction sweep
//!
//! A sweep visits buffers in ascending priority (or just one buffer) and
//! detaches resident, unpinned pages until a byte target is met. Detaching
//! unmaps the page and returns its physical page to the pool free list; the
//! page generation is left alone and bumps on the next attach.
//!
//! # Locking
//!
//! Every operation takes the device lock for its whole duration, including
//! the driver calls it makes. Faults on different VBARs of one device
//! therefore serialize, which keeps residency, pins, priority order and the
//! pool free list mutually consistent.

use crate::config::EngineConfig;
use crate::log_once::LogOnce;
use crate::pool::{PageOwner, PhysicalPool, PoolStats};
use crate::priority::PriorityList;
use crate::signature::Signature;
use crate::stats::{EngineStats, StatsSnapshot};
use crate::vbar::{Allocation, VbarId, VbarInfo, VirtualBuffer};
use crate::{VbarError, VbarResult};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::{smallvec, SmallVec};
use std::sync::Arc;
use vbar_driver::{
    align_down, align_up, Access, DeviceId, DeviceInfo, DevicePtr, DriverBackend, DriverError,
    PhysHandle,
};

static FIRST_NOT_RESIDENT: LogOnce = LogOnce::new();

/// Result of a successful [`DeviceEngine::fault`] call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Every touched page is resident and pinned.
    Resident(Signature),
    /// The budget could not admit the range. Nothing stays pinned.
    NotResident,
}

impl FaultOutcome {
    /// Whether the range is resident.
    #[must_use]
    pub const fn is_resident(&self) -> bool {
        matches!(self, Self::Resident(_))
    }

    /// The signature, if resident.
    #[must_use]
    pub const fn signature(&self) -> Option<&Signature> {
        match self {
            Self::Resident(sig) => Some(sig),
            Self::NotResident => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum SweepScope {
    Buffer(VbarId),
    Device,
}

struct DeviceState {
    vbars: FxHashMap<VbarId, VirtualBuffer>,
    priority: PriorityList,
    pool: PhysicalPool,
    next_id: u64,
    closed: bool,
}

impl DeviceState {
    fn vbar(&self, id: VbarId) -> VbarResult<&VirtualBuffer> {
        self.vbars.get(&id).ok_or(VbarError::UnknownBuffer(id))
    }

    fn vbar_mut(&mut self, id: VbarId) -> VbarResult<&mut VirtualBuffer> {
        self.vbars.get_mut(&id).ok_or(VbarError::UnknownBuffer(id))
    }

    fn resident_pages(&self) -> usize {
        self.vbars.values().map(|v| v.resident_count).sum()
    }
}

/// VBARs, eviction order and physical pool of one device.
pub struct DeviceEngine {
    device: DeviceId,
    info: DeviceInfo,
    driver: Arc<dyn DriverBackend>,
    config: EngineConfig,
    state: Mutex<DeviceState>,
    stats: EngineStats,
}

impl DeviceEngine {
    /// Initialize `device` on `driver` and create an empty engine for it.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the page size is not a multiple of
    /// the device's allocation granularity, or the driver failure if the
    /// device cannot be initialized.
    pub fn new(
        driver: Arc<dyn DriverBackend>,
        device: DeviceId,
        config: EngineConfig,
    ) -> VbarResult<Self> {
        config.validate()?;
        driver.init(device)?;
        let info = driver.device_info(device)?;
        if info.allocation_granularity != 0 && config.page_size % info.allocation_granularity != 0
        {
            return Err(VbarError::Config(format!(
                "page_size {} is not a multiple of the {} byte granularity of {}",
                config.page_size, info.allocation_granularity, device
            )));
        }

        tracing::info!(
            device = %device,
            backend = driver.name(),
            "using {} with {} MB of VRAM",
            info.name,
            info.memory_total_mb()
        );

        let pool = PhysicalPool::new(device, config.page_size, config.physical_budget);
        Ok(Self {
            device,
            info,
            driver,
            config,
            state: Mutex::new(DeviceState {
                vbars: FxHashMap::default(),
                priority: PriorityList::default(),
                pool,
                next_id: 1,
                closed: false,
            }),
            stats: EngineStats::new(),
        })
    }

    /// The device this engine manages.
    #[must_use]
    pub const fn device(&self) -> DeviceId {
        self.device
    }

    /// Device description captured at creation.
    #[must_use]
    pub const fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The driver shared with the rest of the process.
    #[must_use]
    pub fn driver(&self) -> &Arc<dyn DriverBackend> {
        &self.driver
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Reserve a new VBAR of up to `requested_size` bytes.
    ///
    /// The size is rounded up to whole pages and, with
    /// `cap_to_device_memory`, capped to the device's memory. If the driver
    /// refuses the reservation the size is halved (rounded down to whole
    /// pages) until it succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::ReservationFailure`] if not even one page could
    /// be reserved.
    pub fn create(&self, requested_size: usize) -> VbarResult<VbarId> {
        let (base, capacity) = self.reserve_with_backoff(requested_size)?;
        self.register(base, capacity, false)
    }

    /// Wrap a VA range the caller already reserved.
    ///
    /// The capacity is `size` rounded down to whole pages. The range is
    /// never freed by [`destroy`](Self::destroy).
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::InvalidRange`] if the base is null or not aligned
    /// to the device granularity, or `size` is smaller than one page.
    pub fn create_on_reserved(&self, base: DevicePtr, size: usize) -> VbarResult<VbarId> {
        let capacity = align_down(size, self.config.page_size);
        let granularity = self.info.allocation_granularity.max(1) as u64;
        if base.is_null() || capacity == 0 || base.as_raw() % granularity != 0 {
            return Err(VbarError::InvalidRange {
                offset: 0,
                size,
                capacity,
            });
        }
        self.register(base, capacity, true)
    }

    fn reserve_with_backoff(&self, requested: usize) -> VbarResult<(DevicePtr, usize)> {
        let page = self.config.page_size;
        let mut attempt = align_up(requested.max(1), page);
        if self.config.cap_to_device_memory {
            let cap = align_down(self.info.memory_total, page);
            if cap >= page && attempt > cap {
                tracing::debug!(requested, cap, "capping reservation to device memory");
                attempt = cap;
            }
        }

        let mut last_err = None;
        while attempt >= page {
            match self.driver.reserve_va(attempt, page) {
                Ok(base) => {
                    if attempt < requested {
                        tracing::warn!(
                            device = %self.device,
                            requested,
                            reserved = attempt,
                            "reserved a smaller buffer than requested"
                        );
                    }
                    return Ok((base, attempt));
                }
                Err(err) => {
                    tracing::debug!(size = attempt, "reservation failed, halving: {}", err);
                    last_err = Some(err);
                    attempt = align_down(attempt / 2, page);
                }
            }
        }

        Err(VbarError::ReservationFailure {
            requested,
            source: last_err.unwrap_or_else(|| {
                DriverError::out_of_memory("reserve_va", "request smaller than one page")
            }),
        })
    }

    fn register(&self, base: DevicePtr, capacity: usize, external: bool) -> VbarResult<VbarId> {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            if !external {
                if let Err(err) = self.driver.free_va(base, capacity) {
                    tracing::warn!("failed to free reservation after shutdown: {}", err);
                }
            }
            return Err(VbarError::ShutDown);
        }
        let id = VbarId(state.next_id);
        state.next_id += 1;
        state.vbars.insert(
            id,
            VirtualBuffer::new(id, self.device, base, capacity, self.config.page_size, external),
        );
        state.priority.insert(id);
        tracing::info!(
            device = %self.device,
            vbar = %id,
            base = %base,
            capacity,
            external,
            "created buffer"
        );
        Ok(id)
    }

    /// Tear a VBAR down: unmap every resident page, return the physical
    /// pages to the pool and free the reservation unless it was supplied
    /// externally.
    ///
    /// # Errors
    ///
    /// Returns the first failure, after every page and the reservation were
    /// dealt with. Pages whose unmap failed are dropped from the pool rather
    /// than reused, and the reservation is kept, since it still has
    /// mappings.
    pub fn destroy(&self, id: VbarId) -> VbarResult<()> {
        let page = self.config.page_size;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut vbar = state.vbars.remove(&id).ok_or(VbarError::UnknownBuffer(id))?;
        state.priority.remove(id);

        let pinned = vbar.pinned_pages();
        if pinned > 0 {
            tracing::warn!(vbar = %id, pinned, "destroying buffer with pinned pages");
        }

        let mut first_err: Option<VbarError> = None;
        let mut still_mapped = false;
        let resident: SmallVec<[(usize, PhysHandle); 32]> = vbar.resident_pages().collect();
        for (page_idx, handle) in resident {
            let va = vbar.page_va(page_idx);
            vbar.mark_absent(page_idx);
            self.stats.record_unmap(page, false);
            match self.driver.unmap(va, page) {
                Ok(()) => {
                    if let Err(err) = state.pool.release_page(handle) {
                        tracing::error!(vbar = %id, page = page_idx, "{}", err);
                        first_err.get_or_insert(err);
                    }
                }
                Err(err) => {
                    tracing::error!(vbar = %id, page = page_idx, "unmap failed on destroy: {}", err);
                    state.pool.forget_page(handle);
                    still_mapped = true;
                    first_err.get_or_insert(err.into());
                }
            }
        }

        if !vbar.externally_reserved {
            if still_mapped {
                tracing::warn!(vbar = %id, "keeping reservation that still has mappings");
            } else if let Err(err) = self.driver.free_va(vbar.base, vbar.capacity) {
                tracing::error!(vbar = %id, "free_va failed: {}", err);
                first_err.get_or_insert(err.into());
            }
        }

        tracing::info!(device = %self.device, vbar = %id, "destroyed buffer");
        first_err.map_or(Ok(()), Err)
    }

    /// Destroy every VBAR and release all pooled physical memory. Later
    /// `create` calls fail with [`VbarError::ShutDown`].
    ///
    /// # Errors
    ///
    /// Returns the first failure; teardown continues past it.
    pub fn shutdown(&self) -> VbarResult<()> {
        let ids: Vec<VbarId> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.priority.eviction_order().collect()
        };

        let mut first_err = None;
        for id in ids {
            if let Err(err) = self.destroy(id) {
                first_err.get_or_insert(err);
            }
        }

        let mut state = self.state.lock();
        if let Err(err) = state.pool.drain(self.driver.as_ref(), usize::MAX) {
            first_err.get_or_insert(err);
        }
        tracing::debug!(device = %self.device, "engine shut down");
        first_err.map_or(Ok(()), Err)
    }

    // ------------------------------------------------------------------
    // Allocation and residency
    // ------------------------------------------------------------------

    /// Bump-allocate `num_bytes` of virtual space in a VBAR.
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::OutOfVirtualSpace`] if the aligned range would
    /// pass the capacity.
    pub fn alloc(&self, id: VbarId, num_bytes: usize) -> VbarResult<Allocation> {
        let mut state = self.state.lock();
        state
            .vbar_mut(id)?
            .bump(num_bytes, self.config.alloc_alignment)
    }

    /// Make `size` bytes at `offset` resident and pin them.
    ///
    /// On [`FaultOutcome::Resident`] every touched page stays pinned until
    /// [`unpin`](Self::unpin). On [`FaultOutcome::NotResident`] the pins this
    /// call took are released again; pages it already attached stay
    /// resident.
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::InvalidRange`] for a range outside the buffer
    /// and [`VbarError::Driver`] if mapping failed.
    pub fn fault(&self, id: VbarId, offset: usize, size: usize) -> VbarResult<FaultOutcome> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let vbar = state.vbar_mut(id)?;
        let span = vbar.span(offset, size)?;
        vbar.pin(span);
        let missing: SmallVec<[usize; 16]> = vbar.missing_pages(span).collect();
        self.stats.record_fault(missing.is_empty());
        if missing.is_empty() {
            return Ok(FaultOutcome::Resident(vbar.signature(span)));
        }

        match self.make_resident(state, id, &missing) {
            Ok(true) => Ok(FaultOutcome::Resident(state.vbar(id)?.signature(span))),
            Ok(false) => {
                state.vbar_mut(id)?.unpin(span);
                self.stats.record_not_resident();
                if FIRST_NOT_RESIDENT.first() {
                    tracing::info!(
                        device = %self.device,
                        vbar = %id,
                        "memory budget reached, ranges will be reported not resident"
                    );
                } else {
                    tracing::debug!(vbar = %id, offset, size, "not resident");
                }
                Ok(FaultOutcome::NotResident)
            }
            Err(err) => {
                if let Ok(vbar) = state.vbar_mut(id) {
                    vbar.unpin(span);
                }
                Err(err)
            }
        }
    }

    /// Release the pins of the latest fault on a range. Pages that are not
    /// pinned are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::InvalidRange`] for a range outside the buffer.
    pub fn unpin(&self, id: VbarId, offset: usize, size: usize) -> VbarResult<()> {
        let mut state = self.state.lock();
        let vbar = state.vbar_mut(id)?;
        let span = vbar.span(offset, size)?;
        vbar.unpin(span);
        Ok(())
    }

    fn make_resident(
        &self,
        state: &mut DeviceState,
        id: VbarId,
        missing: &[usize],
    ) -> VbarResult<bool> {
        let page = self.config.page_size;
        let needed = missing.len();

        let (resident, limit) = {
            let vbar = state.vbar(id)?;
            (vbar.resident_count, vbar.watermark_pages())
        };
        if let Some(limit) = limit {
            if needed > limit {
                return Ok(false);
            }
            let excess = (resident + needed).saturating_sub(limit);
            if excess > 0 && self.sweep(state, SweepScope::Buffer(id), excess * page)? < excess * page
            {
                return Ok(false);
            }
        }

        if self.config.device_watermark != 0 {
            let limit = self.config.device_watermark / page;
            if needed > limit {
                return Ok(false);
            }
            let excess = (state.resident_pages() + needed).saturating_sub(limit);
            if excess > 0 && self.sweep(state, SweepScope::Device, excess * page)? < excess * page {
                return Ok(false);
            }
        }

        for &page_idx in missing {
            let owner = PageOwner {
                vbar: id,
                page: page_idx,
            };
            let Some(handle) = self.acquire_with_eviction(state, owner)? else {
                return Ok(false);
            };
            self.attach(state, id, page_idx, handle)?;
        }
        Ok(true)
    }

    fn acquire_with_eviction(
        &self,
        state: &mut DeviceState,
        owner: PageOwner,
    ) -> VbarResult<Option<PhysHandle>> {
        let mut attempts = 0;
        loop {
            match state.pool.acquire_page(self.driver.as_ref(), owner) {
                Ok(handle) => return Ok(Some(handle)),
                Err(VbarError::BudgetExceeded { .. }) if attempts < self.config.max_acquire_retries => {
                    attempts += 1;
                    if self.sweep(state, SweepScope::Device, self.config.page_size)? == 0 {
                        return Ok(None);
                    }
                }
                Err(VbarError::BudgetExceeded { .. }) => return Ok(None),
                Err(err) => return Err(err),
            }
        }
    }

    fn attach(
        &self,
        state: &mut DeviceState,
        id: VbarId,
        page_idx: usize,
        handle: PhysHandle,
    ) -> VbarResult<()> {
        let page = self.config.page_size;
        let va = state.vbar(id)?.page_va(page_idx);

        if let Err(err) = self.driver.map(va, page, handle) {
            state.pool.release_page(handle)?;
            return Err(err.into());
        }

        if let Err(err) = self
            .driver
            .set_access(va, page, self.device, Access::ReadWrite)
        {
            match self.driver.unmap(va, page) {
                Ok(()) => {
                    if let Err(release_err) = state.pool.release_page(handle) {
                        tracing::error!(vbar = %id, page = page_idx, "{}", release_err);
                    }
                }
                Err(unmap_err) => {
                    // Still mapped: keep it on the books so eviction retries the unmap.
                    tracing::error!(vbar = %id, page = page_idx, "unmap after failed set_access: {}", unmap_err);
                    state.vbar_mut(id)?.mark_resident(page_idx, handle);
                    self.stats.record_map(page);
                }
            }
            return Err(err.into());
        }

        state.vbar_mut(id)?.mark_resident(page_idx, handle);
        self.stats.record_map(page);
        tracing::trace!(vbar = %id, page = page_idx, va = %va, "attached {}", handle);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    fn sweep(&self, state: &mut DeviceState, scope: SweepScope, target: usize) -> VbarResult<usize> {
        if target == 0 {
            return Ok(0);
        }
        let page = self.config.page_size;
        let order: SmallVec<[VbarId; 8]> = match scope {
            SweepScope::Buffer(id) => smallvec![id],
            SweepScope::Device => state.priority.eviction_order().collect(),
        };

        let mut freed = 0;
        'buffers: for id in order {
            if freed >= target {
                break;
            }
            let candidates: SmallVec<[usize; 32]> = match state.vbars.get(&id) {
                Some(vbar) => vbar.evictable_pages().collect(),
                None => continue,
            };
            for page_idx in candidates {
                if freed >= target {
                    break 'buffers;
                }
                self.evict_page(state, id, page_idx)?;
                freed += page;
            }
        }

        if freed > 0 {
            tracing::debug!(device = %self.device, ?scope, target, freed, "eviction sweep");
        }
        Ok(freed)
    }

    fn evict_page(&self, state: &mut DeviceState, id: VbarId, page_idx: usize) -> VbarResult<()> {
        let page = self.config.page_size;
        let vbar = state.vbars.get_mut(&id).ok_or(VbarError::UnknownBuffer(id))?;
        let va = vbar.page_va(page_idx);

        if let Err(err) = self.driver.unmap(va, page) {
            tracing::error!(vbar = %id, page = page_idx, "unmap failed during eviction: {}", err);
            return Err(err.into());
        }

        let handle = vbar.mark_absent(page_idx).ok_or_else(|| {
            VbarError::Internal(format!("{id} page {page_idx} evicted while absent"))
        })?;
        state.pool.release_page(handle)?;
        self.stats.record_unmap(page, true);
        tracing::trace!(vbar = %id, page = page_idx, "evicted {}", handle);
        Ok(())
    }

    /// Evict unpinned pages of one VBAR until at least `bytes_target` bytes
    /// were freed or none are left. Returns the bytes freed.
    ///
    /// # Errors
    ///
    /// Returns the driver failure if an unmap failed.
    pub fn free_memory(&self, id: VbarId, bytes_target: usize) -> VbarResult<usize> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.vbar(id)?;
        self.sweep(state, SweepScope::Buffer(id), bytes_target)
    }

    /// Free device memory for use outside the engine: evict across all
    /// VBARs in priority order, then release pooled pages to the driver.
    /// Returns the bytes released to the driver.
    ///
    /// # Errors
    ///
    /// Returns the driver failure if an unmap or release failed.
    pub fn reclaim(&self, bytes_target: usize) -> VbarResult<usize> {
        if bytes_target == 0 {
            return Ok(0);
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let pooled = state.pool.free_bytes();
        if pooled < bytes_target {
            self.sweep(state, SweepScope::Device, bytes_target - pooled)?;
        }
        state.pool.drain(self.driver.as_ref(), bytes_target)
    }

    /// Release pooled free pages to the driver without evicting anything.
    ///
    /// # Errors
    ///
    /// Returns the driver failure if a release failed.
    pub fn drain_pool(&self, bytes_target: usize) -> VbarResult<usize> {
        self.state
            .lock()
            .pool
            .drain(self.driver.as_ref(), bytes_target)
    }

    // ------------------------------------------------------------------
    // Priority and watermarks
    // ------------------------------------------------------------------

    /// Move a VBAR to the evicted-last end of the device order.
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::UnknownBuffer`] for an unknown id.
    pub fn prioritize(&self, id: VbarId) -> VbarResult<()> {
        if self.state.lock().priority.prioritize(id) {
            Ok(())
        } else {
            Err(VbarError::UnknownBuffer(id))
        }
    }

    /// Move a VBAR to the evicted-first end of the device order.
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::UnknownBuffer`] for an unknown id.
    pub fn deprioritize(&self, id: VbarId) -> VbarResult<()> {
        if self.state.lock().priority.deprioritize(id) {
            Ok(())
        } else {
            Err(VbarError::UnknownBuffer(id))
        }
    }

    /// Limit the resident bytes of one VBAR (0 removes the limit).
    ///
    /// Unpinned pages above the new limit are evicted right away. Pinned
    /// pages are never evicted, so a limit below the pinned footprint only
    /// takes full effect once those pages are unpinned.
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::UnknownBuffer`], or a driver failure from the
    /// sweep.
    pub fn set_watermark_limit(&self, id: VbarId, bytes: usize) -> VbarResult<()> {
        let page = self.config.page_size;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let vbar = state.vbar_mut(id)?;
        vbar.watermark_limit = bytes;
        let Some(limit) = vbar.watermark_pages() else {
            return Ok(());
        };
        let excess = vbar.resident_count.saturating_sub(limit);
        if excess > 0 {
            let freed = self.sweep(state, SweepScope::Buffer(id), excess * page)?;
            if freed < excess * page {
                tracing::warn!(vbar = %id, limit = bytes, "pinned pages keep buffer above its watermark");
            }
        }
        Ok(())
    }

    /// Remove the watermark limit of every VBAR on this device.
    pub fn reset_watermark_limits(&self) {
        for vbar in self.state.lock().vbars.values_mut() {
            vbar.watermark_limit = 0;
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Resident bytes of one VBAR.
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::UnknownBuffer`] for an unknown id.
    pub fn loaded_size(&self, id: VbarId) -> VbarResult<usize> {
        Ok(self.state.lock().vbar(id)?.resident_bytes())
    }

    /// Base address of a VBAR.
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::UnknownBuffer`] for an unknown id.
    pub fn base(&self, id: VbarId) -> VbarResult<DevicePtr> {
        Ok(self.state.lock().vbar(id)?.base)
    }

    /// Reserved bytes of a VBAR.
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::UnknownBuffer`] for an unknown id.
    pub fn capacity(&self, id: VbarId) -> VbarResult<usize> {
        Ok(self.state.lock().vbar(id)?.capacity)
    }

    /// Full description of a VBAR.
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::UnknownBuffer`] for an unknown id.
    pub fn info(&self, id: VbarId) -> VbarResult<VbarInfo> {
        let state = self.state.lock();
        let rank = state.priority.rank(id).unwrap_or(0);
        Ok(state.vbar(id)?.info(rank))
    }

    /// Live VBARs in eviction order.
    #[must_use]
    pub fn buffers(&self) -> Vec<VbarId> {
        self.state.lock().priority.eviction_order().collect()
    }

    /// Resident bytes across all VBARs.
    #[must_use]
    pub fn resident_bytes(&self) -> usize {
        self.state.lock().resident_pages() * self.config.page_size
    }

    /// Engine counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Pool counters.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.state.lock().pool.stats()
    }

    /// Cross-check residency tables against the pool.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistency found.
    pub fn verify_consistency(&self) -> Result<(), String> {
        let state = self.state.lock();
        let mut seen: FxHashSet<PhysHandle> = FxHashSet::default();
        let mut resident_total = 0;

        for vbar in state.vbars.values() {
            let mut resident = 0;
            for (page_idx, handle) in vbar.resident_pages() {
                resident += 1;
                if !seen.insert(handle) {
                    return Err(format!("{handle} mapped into more than one page"));
                }
                if state.pool.is_free(handle) {
                    return Err(format!("{handle} is resident and on the free list"));
                }
                let expected = PageOwner {
                    vbar: vbar.id,
                    page: page_idx,
                };
                if state.pool.owner_of(handle) != Some(expected) {
                    return Err(format!("{handle} owner mismatch for {} page {page_idx}", vbar.id));
                }
            }
            if resident != vbar.resident_count {
                return Err(format!(
                    "{} counts {} resident pages, table has {resident}",
                    vbar.id, vbar.resident_count
                ));
            }
            resident_total += resident;
        }

        let assigned = state.pool.assignments().count();
        if assigned != resident_total {
            return Err(format!(
                "pool has {assigned} assigned pages, buffers hold {resident_total}"
            ));
        }
        if state.priority.len() != state.vbars.len() {
            return Err("priority list and buffer table disagree".to_string());
        }
        Ok(())
    }
}

impl Drop for DeviceEngine {
    fn drop(&mut self) {
        if !self.state.get_mut().closed {
            if let Err(err) = self.shutdown() {
                tracing::warn!(device = %self.device, "engine teardown failed: {}", err);
            }
        }
    }
}
