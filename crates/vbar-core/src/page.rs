//! Per-page residency state and page spans.

use std::ops::Range;
use vbar_driver::PhysHandle;

/// Residency record of one VBAR page.
///
/// # Invariants
///
/// - `physical.is_some()` exactly when the page is resident
/// - `generation` changes once per absent→resident transition and is never 0
///   after the first attach; 0 means the page was never resident
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct PageState {
    pub(crate) generation: u32,
    pub(crate) pins: u32,
    pub(crate) physical: Option<PhysHandle>,
}

impl PageState {
    pub(crate) const fn is_resident(&self) -> bool {
        self.physical.is_some()
    }

    pub(crate) const fn is_pinned(&self) -> bool {
        self.pins > 0
    }

    pub(crate) const fn is_evictable(&self) -> bool {
        self.is_resident() && !self.is_pinned()
    }

    /// Record a fresh mapping. The generation wraps past `u32::MAX` to 1.
    pub(crate) fn attach(&mut self, handle: PhysHandle) {
        self.physical = Some(handle);
        self.generation = match self.generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
    }

    /// Forget the mapping, returning the handle that backed the page.
    pub(crate) fn detach(&mut self) -> Option<PhysHandle> {
        self.physical.take()
    }
}

/// The pages touched by a byte range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageSpan {
    /// First page index.
    pub first: usize,
    /// One past the last page index.
    pub end: usize,
}

impl PageSpan {
    /// Pages covering `size` bytes starting at `offset`.
    ///
    /// A zero-sized range covers no pages.
    #[must_use]
    pub const fn covering(offset: usize, size: usize, page_size: usize) -> Self {
        let first = offset / page_size;
        if size == 0 {
            return Self { first, end: first };
        }
        let end = (offset + size - 1) / page_size + 1;
        Self { first, end }
    }

    /// Number of pages in the span.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.first
    }

    /// Whether the span covers no pages.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end == self.first
    }

    /// Page indices in ascending order.
    #[must_use]
    pub fn pages(&self) -> Range<usize> {
        self.first..self.end
    }

    /// Whether `page` lies in the span.
    #[must_use]
    pub const fn contains(&self, page: usize) -> bool {
        page >= self.first && page < self.end
    }
}
