//! Engine counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Live counters for one device engine.
///
/// Updated under the device lock but readable without it.
#[derive(Debug, Default)]
pub struct EngineStats {
    faults: AtomicU64,
    fault_hits: AtomicU64,
    not_resident: AtomicU64,
    pages_mapped: AtomicU64,
    pages_evicted: AtomicU64,
    resident_bytes: AtomicUsize,
    peak_resident_bytes: AtomicUsize,
}

impl EngineStats {
    /// Create zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            faults: AtomicU64::new(0),
            fault_hits: AtomicU64::new(0),
            not_resident: AtomicU64::new(0),
            pages_mapped: AtomicU64::new(0),
            pages_evicted: AtomicU64::new(0),
            resident_bytes: AtomicUsize::new(0),
            peak_resident_bytes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn record_fault(&self, hit: bool) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.fault_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_not_resident(&self) {
        self.not_resident.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_map(&self, bytes: usize) {
        self.pages_mapped.fetch_add(1, Ordering::Relaxed);
        let new_total = self.resident_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
        let mut current_peak = self.peak_resident_bytes.load(Ordering::SeqCst);
        while new_total > current_peak {
            match self.peak_resident_bytes.compare_exchange_weak(
                current_peak,
                new_total,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(p) => current_peak = p,
            }
        }
    }

    pub(crate) fn record_unmap(&self, bytes: usize, evicted: bool) {
        self.resident_bytes.fetch_sub(bytes, Ordering::SeqCst);
        if evicted {
            self.pages_evicted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copy the counters out.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            faults: self.faults.load(Ordering::Relaxed),
            fault_hits: self.fault_hits.load(Ordering::Relaxed),
            not_resident: self.not_resident.load(Ordering::Relaxed),
            pages_mapped: self.pages_mapped.load(Ordering::Relaxed),
            pages_evicted: self.pages_evicted.load(Ordering::Relaxed),
            resident_bytes: self.resident_bytes.load(Ordering::SeqCst),
            peak_resident_bytes: self.peak_resident_bytes.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Calls to `fault` that got past argument checks.
    pub faults: u64,
    /// Faults whose pages were all resident already.
    pub fault_hits: u64,
    /// Faults answered with NOT_RESIDENT.
    pub not_resident: u64,
    /// Absent→resident transitions.
    pub pages_mapped: u64,
    /// Pages detached by eviction sweeps.
    pub pages_evicted: u64,
    /// Bytes currently resident.
    pub resident_bytes: usize,
    /// Highest value `resident_bytes` has reached.
    pub peak_resident_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_tracking() {
        let stats = EngineStats::new();
        stats.record_map(100);
        stats.record_map(50);
        stats.record_unmap(100, true);
        stats.record_map(10);
        let snap = stats.snapshot();
        assert_eq!(snap.resident_bytes, 60);
        assert_eq!(snap.peak_resident_bytes, 150);
        assert_eq!(snap.pages_mapped, 3);
        assert_eq!(snap.pages_evicted, 1);
    }

    #[test]
    fn test_fault_counters() {
        let stats = EngineStats::new();
        stats.record_fault(true);
        stats.record_fault(false);
        stats.record_not_resident();
        let snap = stats.snapshot();
        assert_eq!((snap.faults, snap.fault_hits, snap.not_resident), (2, 1, 1));
    }
}
