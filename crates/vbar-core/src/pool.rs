//! Physical page pool.
//!
//! The pool owns every physical page a device engine has created. A page is
//! either on the free list or assigned to exactly one VBAR page. Released
//! pages go back to the free list rather than to the driver, so the next
//! fault can reuse them without another `create_physical`; [`drain`]
//! returns free pages to the driver when something outside the engine needs
//! the memory.
//!
//! The pool itself is not synchronized. It lives inside the device state
//! and is only touched under the device lock.
//!
//! [`drain`]: PhysicalPool::drain

use crate::vbar::VbarId;
use crate::{VbarError, VbarResult};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use vbar_driver::{DeviceId, DriverBackend, PhysHandle};

/// The VBAR page a physical page is assigned to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageOwner {
    /// Buffer.
    pub vbar: VbarId,
    /// Page index within the buffer.
    pub page: usize,
}

/// Pool counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Bytes of physical memory created and not yet released to the driver.
    pub committed_bytes: usize,
    /// Pages on the free list.
    pub free_pages: usize,
    /// Pages assigned to VBAR pages.
    pub assigned_pages: usize,
    /// Pages lost to failed unmaps.
    pub leaked_pages: usize,
}

/// Per-device physical page pool.
#[derive(Debug)]
pub struct PhysicalPool {
    device: DeviceId,
    page_size: usize,
    budget: usize,
    free: Vec<PhysHandle>,
    assigned: FxHashMap<PhysHandle, PageOwner>,
    committed: usize,
    leaked: usize,
}

impl PhysicalPool {
    /// Create an empty pool. A `budget` of 0 lets the driver decide.
    #[must_use]
    pub fn new(device: DeviceId, page_size: usize, budget: usize) -> Self {
        Self {
            device,
            page_size,
            budget,
            free: Vec::new(),
            assigned: FxHashMap::default(),
            committed: 0,
            leaked: 0,
        }
    }

    /// Hand out a page for `owner`, reusing a free one when possible.
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::BudgetExceeded`] when the budget or the driver
    /// cannot admit another page, and [`VbarError::Driver`] for any other
    /// driver failure.
    pub fn acquire_page(
        &mut self,
        driver: &dyn DriverBackend,
        owner: PageOwner,
    ) -> VbarResult<PhysHandle> {
        let handle = match self.free.pop() {
            Some(handle) => handle,
            None => self.create_page(driver)?,
        };
        self.assigned.insert(handle, owner);
        Ok(handle)
    }

    fn create_page(&mut self, driver: &dyn DriverBackend) -> VbarResult<PhysHandle> {
        if self.budget != 0 && self.committed + self.page_size > self.budget {
            return Err(VbarError::BudgetExceeded {
                requested: self.page_size,
                available: self.budget - self.committed,
            });
        }
        match driver.create_physical(self.page_size, self.device) {
            Ok(handle) => {
                self.committed += self.page_size;
                Ok(handle)
            }
            Err(err) if err.is_out_of_memory() => {
                tracing::debug!(device = %self.device, "driver refused a physical page: {}", err);
                Err(VbarError::BudgetExceeded {
                    requested: self.page_size,
                    available: 0,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Return an assigned page to the free list.
    ///
    /// The caller must have unmapped it first.
    ///
    /// # Errors
    ///
    /// Returns [`VbarError::Internal`] if the page is not assigned.
    pub fn release_page(&mut self, handle: PhysHandle) -> VbarResult<()> {
        if self.assigned.remove(&handle).is_none() {
            return Err(VbarError::Internal(format!(
                "{handle} released but not assigned"
            )));
        }
        self.free.push(handle);
        Ok(())
    }

    /// Drop an assigned page from the books without reusing it.
    ///
    /// Used when an unmap failed: the page may still be mapped, so it must
    /// neither return to the free list nor be released to the driver.
    pub fn forget_page(&mut self, handle: PhysHandle) {
        if self.assigned.remove(&handle).is_some() {
            self.leaked += 1;
            tracing::warn!(device = %self.device, "leaking physical page {}", handle);
        }
    }

    /// Release free pages to the driver until at least `bytes_target` bytes
    /// were released or the free list is empty. Returns the bytes released.
    ///
    /// # Errors
    ///
    /// Returns the first driver failure once the remaining pages were
    /// tried. Pages whose release failed stay on the free list.
    pub fn drain(&mut self, driver: &dyn DriverBackend, bytes_target: usize) -> VbarResult<usize> {
        let mut released = 0;
        let mut failed: Vec<PhysHandle> = Vec::new();
        let mut first_err = None;
        while released < bytes_target {
            let Some(handle) = self.free.pop() else {
                break;
            };
            match driver.release_physical(handle) {
                Ok(()) => {
                    self.committed -= self.page_size;
                    released += self.page_size;
                }
                Err(err) => {
                    tracing::error!(device = %self.device, "releasing {} failed: {}", handle, err);
                    failed.push(handle);
                    first_err.get_or_insert(err);
                }
            }
        }
        self.free.extend(failed);
        if released > 0 {
            tracing::debug!(device = %self.device, released, "drained physical pages");
        }
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(released),
        }
    }

    /// Owner of an assigned page.
    #[must_use]
    pub fn owner_of(&self, handle: PhysHandle) -> Option<PageOwner> {
        self.assigned.get(&handle).copied()
    }

    /// Bytes sitting on the free list.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.free.len() * self.page_size
    }

    /// Page size served by this pool.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            committed_bytes: self.committed,
            free_pages: self.free.len(),
            assigned_pages: self.assigned.len(),
            leaked_pages: self.leaked,
        }
    }

    pub(crate) fn assignments(&self) -> impl Iterator<Item = (PhysHandle, PageOwner)> + '_ {
        self.assigned.iter().map(|(&h, &o)| (h, o))
    }

    pub(crate) fn is_free(&self, handle: PhysHandle) -> bool {
        self.free.contains(&handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vbar_driver::{DriverErrorKind, MockDeviceConfig, MockDriver, MockOp};

    const PAGE: usize = 32 << 20;

    fn owner(page: usize) -> PageOwner {
        PageOwner {
            vbar: VbarId(1),
            page,
        }
    }

    #[test]
    fn test_reuses_free_pages() {
        let driver = MockDriver::new(MockDeviceConfig::with_memory(1 << 30));
        let mut pool = PhysicalPool::new(DeviceId(0), PAGE, 0);
        let a = pool.acquire_page(&driver, owner(0)).unwrap();
        pool.release_page(a).unwrap();
        let b = pool.acquire_page(&driver, owner(1)).unwrap();
        assert_eq!(a, b);
        assert_eq!(driver.calls(MockOp::CreatePhysical), 1);
        assert_eq!(pool.owner_of(b), Some(owner(1)));
    }

    #[test]
    fn test_budget_is_enforced() {
        let driver = MockDriver::new(MockDeviceConfig::with_memory(1 << 30));
        let mut pool = PhysicalPool::new(DeviceId(0), PAGE, 2 * PAGE);
        pool.acquire_page(&driver, owner(0)).unwrap();
        pool.acquire_page(&driver, owner(1)).unwrap();
        let err = pool.acquire_page(&driver, owner(2)).unwrap_err();
        assert!(matches!(err, VbarError::BudgetExceeded { available: 0, .. }));
        assert_eq!(pool.stats().committed_bytes, 2 * PAGE);
    }

    #[test]
    fn test_driver_oom_maps_to_budget_exceeded() {
        let driver = MockDriver::new(MockDeviceConfig::with_memory(PAGE));
        let mut pool = PhysicalPool::new(DeviceId(0), PAGE, 0);
        pool.acquire_page(&driver, owner(0)).unwrap();
        assert!(matches!(
            pool.acquire_page(&driver, owner(1)),
            Err(VbarError::BudgetExceeded { .. })
        ));
    }

    #[test]
    fn test_other_driver_errors_propagate() {
        let driver = MockDriver::new(MockDeviceConfig::with_memory(1 << 30));
        driver.inject_failure(MockOp::CreatePhysical, DriverErrorKind::Other);
        let mut pool = PhysicalPool::new(DeviceId(0), PAGE, 0);
        assert!(matches!(
            pool.acquire_page(&driver, owner(0)),
            Err(VbarError::Driver(_))
        ));
        assert_eq!(pool.stats().assigned_pages, 0);
    }

    #[test]
    fn test_release_unassigned_is_rejected() {
        let mut pool = PhysicalPool::new(DeviceId(0), PAGE, 0);
        assert!(matches!(
            pool.release_page(PhysHandle::from_raw(77)),
            Err(VbarError::Internal(_))
        ));
    }

    #[test]
    fn test_drain_releases_to_driver() {
        let driver = MockDriver::new(MockDeviceConfig::with_memory(1 << 30));
        let mut pool = PhysicalPool::new(DeviceId(0), PAGE, 0);
        let handles: Vec<_> = (0..3)
            .map(|i| pool.acquire_page(&driver, owner(i)).unwrap())
            .collect();
        for h in &handles[..2] {
            pool.release_page(*h).unwrap();
        }
        assert_eq!(pool.drain(&driver, PAGE + 1).unwrap(), 2 * PAGE);
        assert_eq!(driver.live_physical(), 1);
        assert_eq!(pool.drain(&driver, PAGE).unwrap(), 0);
        assert_eq!(pool.stats().committed_bytes, PAGE);
    }

    #[test]
    fn test_drain_failure_keeps_page() {
        let driver = MockDriver::new(MockDeviceConfig::with_memory(1 << 30));
        let mut pool = PhysicalPool::new(DeviceId(0), PAGE, 0);
        let h = pool.acquire_page(&driver, owner(0)).unwrap();
        pool.release_page(h).unwrap();
        driver.inject_failure(MockOp::ReleasePhysical, DriverErrorKind::Other);
        assert!(pool.drain(&driver, PAGE).is_err());
        assert_eq!(pool.stats().free_pages, 1);
        assert_eq!(pool.drain(&driver, PAGE).unwrap(), PAGE);
    }

    #[test]
    fn test_drain_continues_past_failed_release() {
        let driver = MockDriver::new(MockDeviceConfig::with_memory(1 << 30));
        let mut pool = PhysicalPool::new(DeviceId(0), PAGE, 0);
        let handles: Vec<_> = (0..3)
            .map(|i| pool.acquire_page(&driver, owner(i)).unwrap())
            .collect();
        for h in &handles {
            pool.release_page(*h).unwrap();
        }
        driver.inject_failure(MockOp::ReleasePhysical, DriverErrorKind::Other);
        assert!(pool.drain(&driver, usize::MAX).is_err());
        assert_eq!(driver.live_physical(), 1);
        let stats = pool.stats();
        assert_eq!(stats.free_pages, 1);
        assert_eq!(stats.committed_bytes, PAGE);
    }

    #[test]
    fn test_forget_page() {
        let driver = MockDriver::new(MockDeviceConfig::with_memory(1 << 30));
        let mut pool = PhysicalPool::new(DeviceId(0), PAGE, 0);
        let h = pool.acquire_page(&driver, owner(0)).unwrap();
        pool.forget_page(h);
        let stats = pool.stats();
        assert_eq!(stats.assigned_pages, 0);
        assert_eq!(stats.free_pages, 0);
        assert_eq!(stats.leaked_pages, 1);
    }
}
