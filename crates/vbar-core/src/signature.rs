//! Generation signatures.
//!
//! A [`Signature`] snapshots the generation of every page a range touches.
//! Callers keep the signature returned when they last wrote data into a
//! range; if a later fault returns a different one, at least one page was
//! evicted and re-attached in between and its contents are untrusted.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Per-page generations over a range, in page order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    first_page: usize,
    generations: SmallVec<[u32; 8]>,
}

impl Signature {
    /// Build a signature starting at `first_page`.
    #[must_use]
    pub fn new(first_page: usize, generations: impl IntoIterator<Item = u32>) -> Self {
        Self {
            first_page,
            generations: generations.into_iter().collect(),
        }
    }

    /// Index of the first covered page.
    #[must_use]
    pub const fn first_page(&self) -> usize {
        self.first_page
    }

    /// Generations in page order.
    #[must_use]
    pub fn generations(&self) -> &[u32] {
        &self.generations
    }

    /// Number of covered pages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.generations.len()
    }

    /// Whether no pages are covered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    /// Whether data written under `earlier` may have been lost.
    ///
    /// Signatures over different ranges are always considered stale.
    #[must_use]
    pub fn is_stale_against(&self, earlier: &Self) -> bool {
        self != earlier
    }

    /// Copy the generations into a caller buffer, returning how many were
    /// written.
    pub fn write_into(&self, out: &mut [u32]) -> usize {
        let n = self.generations.len().min(out.len());
        out[..n].copy_from_slice(&self.generations[..n]);
        n
    }

    /// Slots a caller must provide for a range of `size` bytes.
    ///
    /// A range can straddle one extra page on each end of its page-aligned
    /// footprint.
    #[must_use]
    pub const fn slots_for(size: usize, page_size: usize) -> usize {
        size / page_size + 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 32 << 20;

    #[test]
    fn test_equality_and_staleness() {
        let a = Signature::new(2, [1, 1, 3]);
        let b = Signature::new(2, [1, 1, 3]);
        let c = Signature::new(2, [1, 2, 3]);
        assert_eq!(a, b);
        assert!(!b.is_stale_against(&a));
        assert!(c.is_stale_against(&a));
        assert!(Signature::new(3, [1, 1, 3]).is_stale_against(&a));
    }

    #[test]
    fn test_write_into_truncates() {
        let sig = Signature::new(0, [5, 6, 7]);
        let mut out = [0u32; 2];
        assert_eq!(sig.write_into(&mut out), 2);
        assert_eq!(out, [5, 6]);
        let mut wide = [0u32; 8];
        assert_eq!(sig.write_into(&mut wide), 3);
        assert_eq!(&wide[..4], &[5, 6, 7, 0]);
    }

    #[test]
    fn test_slots_cover_worst_case_straddle() {
        // 2 pages of payload starting mid-page touch 3 pages.
        assert!(Signature::slots_for(2 * PAGE, PAGE) >= 3);
        assert_eq!(Signature::slots_for(1, PAGE), 2);
    }
}
