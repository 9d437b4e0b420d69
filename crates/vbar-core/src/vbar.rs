//! Virtual buffers.
//!
//! A [`VirtualBuffer`] owns one VA reservation and the residency table for
//! it. It never talks to the driver itself: the device engine maps and
//! unmaps on its behalf and records the outcome here.

use crate::page::{PageSpan, PageState};
use crate::signature::Signature;
use crate::{VbarError, VbarResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use vbar_driver::{align_up, DeviceId, DevicePtr, PhysHandle};

/// Identifier of a VBAR, unique within its device engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VbarId(pub u64);

impl fmt::Display for VbarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vbar#{}", self.0)
    }
}

/// A range handed out by `alloc`. Carries no residency state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Allocation {
    /// Owning buffer.
    pub vbar: VbarId,
    /// Offset from the buffer base.
    pub offset: usize,
    /// Length in bytes.
    pub size: usize,
}

impl Allocation {
    /// One past the last byte.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Read-only description of a buffer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VbarInfo {
    /// Buffer id.
    pub id: VbarId,
    /// Owning device.
    pub device: DeviceId,
    /// First byte of the reservation.
    pub base: DevicePtr,
    /// Reserved bytes (a whole number of pages).
    pub capacity: usize,
    /// Residency granularity.
    pub page_size: usize,
    /// Bytes handed out by `alloc` so far, including alignment padding.
    pub allocated: usize,
    /// Bytes currently resident.
    pub resident_bytes: usize,
    /// Resident-byte limit (0 = unlimited).
    pub watermark_limit: usize,
    /// Position in the eviction order (0 = evicted first).
    pub priority_rank: usize,
    /// Whether the VA range was supplied by the caller.
    pub externally_reserved: bool,
}

pub(crate) struct VirtualBuffer {
    pub(crate) id: VbarId,
    pub(crate) device: DeviceId,
    pub(crate) base: DevicePtr,
    pub(crate) capacity: usize,
    pub(crate) page_size: usize,
    pub(crate) cursor: usize,
    pub(crate) pages: Vec<PageState>,
    pub(crate) resident_count: usize,
    pub(crate) watermark_limit: usize,
    pub(crate) externally_reserved: bool,
}

impl VirtualBuffer {
    pub(crate) fn new(
        id: VbarId,
        device: DeviceId,
        base: DevicePtr,
        capacity: usize,
        page_size: usize,
        externally_reserved: bool,
    ) -> Self {
        debug_assert_eq!(capacity % page_size, 0);
        Self {
            id,
            device,
            base,
            capacity,
            page_size,
            cursor: 0,
            pages: vec![PageState::default(); capacity / page_size],
            resident_count: 0,
            watermark_limit: 0,
            externally_reserved,
        }
    }

    /// Validate a byte range and return the pages it touches.
    pub(crate) fn span(&self, offset: usize, size: usize) -> VbarResult<PageSpan> {
        match offset.checked_add(size) {
            Some(end) if end <= self.capacity => Ok(PageSpan::covering(offset, size, self.page_size)),
            _ => Err(VbarError::InvalidRange {
                offset,
                size,
                capacity: self.capacity,
            }),
        }
    }

    /// Bump-allocate `num_bytes` at the next `alignment` boundary.
    pub(crate) fn bump(&mut self, num_bytes: usize, alignment: usize) -> VbarResult<Allocation> {
        let offset = align_up(self.cursor, alignment);
        let remaining = self.capacity.saturating_sub(offset);
        if offset > self.capacity || num_bytes > remaining {
            return Err(VbarError::OutOfVirtualSpace {
                requested: num_bytes,
                remaining,
            });
        }
        self.cursor = offset + num_bytes;
        Ok(Allocation {
            vbar: self.id,
            offset,
            size: num_bytes,
        })
    }

    pub(crate) fn page_va(&self, page: usize) -> DevicePtr {
        self.base.offset(page * self.page_size)
    }

    pub(crate) const fn resident_bytes(&self) -> usize {
        self.resident_count * self.page_size
    }

    /// Page budget implied by the watermark, if one is set.
    pub(crate) const fn watermark_pages(&self) -> Option<usize> {
        if self.watermark_limit == 0 {
            None
        } else {
            Some(self.watermark_limit / self.page_size)
        }
    }

    pub(crate) fn signature(&self, span: PageSpan) -> Signature {
        Signature::new(span.first, span.pages().map(|p| self.pages[p].generation))
    }

    pub(crate) fn pin(&mut self, span: PageSpan) {
        for page in span.pages() {
            self.pages[page].pins = self.pages[page].pins.saturating_add(1);
        }
    }

    pub(crate) fn unpin(&mut self, span: PageSpan) {
        for page in span.pages() {
            self.pages[page].pins = self.pages[page].pins.saturating_sub(1);
        }
    }

    pub(crate) fn missing_pages(&self, span: PageSpan) -> impl Iterator<Item = usize> + '_ {
        span.pages().filter(|&p| !self.pages[p].is_resident())
    }

    pub(crate) fn evictable_pages(&self) -> impl Iterator<Item = usize> + '_ {
        self.pages
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_evictable())
            .map(|(i, _)| i)
    }

    pub(crate) fn resident_pages(&self) -> impl Iterator<Item = (usize, PhysHandle)> + '_ {
        self.pages
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.physical.map(|h| (i, h)))
    }

    pub(crate) fn mark_resident(&mut self, page: usize, handle: PhysHandle) {
        debug_assert!(!self.pages[page].is_resident());
        self.pages[page].attach(handle);
        self.resident_count += 1;
    }

    pub(crate) fn mark_absent(&mut self, page: usize) -> Option<PhysHandle> {
        let handle = self.pages[page].detach();
        if handle.is_some() {
            self.resident_count -= 1;
        }
        handle
    }

    pub(crate) fn pinned_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.is_pinned()).count()
    }

    pub(crate) fn info(&self, priority_rank: usize) -> VbarInfo {
        VbarInfo {
            id: self.id,
            device: self.device,
            base: self.base,
            capacity: self.capacity,
            page_size: self.page_size,
            allocated: self.cursor,
            resident_bytes: self.resident_bytes(),
            watermark_limit: self.watermark_limit,
            priority_rank,
            externally_reserved: self.externally_reserved,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 32 << 20;

    fn buffer(pages: usize) -> VirtualBuffer {
        VirtualBuffer::new(
            VbarId(1),
            DeviceId(0),
            DevicePtr::from_raw(0x10_0000_0000),
            pages * PAGE,
            PAGE,
            false,
        )
    }

    #[test]
    fn test_bump_alignment_and_no_overlap() {
        let mut v = buffer(2);
        let a = v.bump(100, 512).unwrap();
        let b = v.bump(1, 512).unwrap();
        let c = v.bump(0, 512).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 512);
        assert_eq!(c.offset, 1024);
        assert!(a.end() <= b.offset);
    }

    #[test]
    fn test_bump_exhaustion() {
        let mut v = buffer(1);
        v.bump(PAGE - 100, 512).unwrap();
        let err = v.bump(200, 512).unwrap_err();
        assert!(matches!(err, VbarError::OutOfVirtualSpace { .. }));
        // An exact fit still succeeds.
        let mut w = buffer(1);
        assert_eq!(w.bump(PAGE, 512).unwrap().size, PAGE);
    }

    #[test]
    fn test_span_validation() {
        let v = buffer(4);
        assert_eq!(v.span(PAGE, 2 * PAGE).unwrap().pages(), 1..3);
        assert!(v.span(3 * PAGE, PAGE + 1).is_err());
        assert!(v.span(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_pins_saturate_at_zero() {
        let mut v = buffer(2);
        let span = v.span(0, 2 * PAGE).unwrap();
        v.unpin(span);
        assert_eq!(v.pinned_pages(), 0);
        v.pin(span);
        assert_eq!(v.pinned_pages(), 2);
        v.unpin(span);
        v.unpin(span);
        assert_eq!(v.pinned_pages(), 0);
    }

    #[test]
    fn test_residency_bookkeeping() {
        let mut v = buffer(3);
        v.mark_resident(1, PhysHandle::from_raw(5));
        assert_eq!(v.resident_bytes(), PAGE);
        assert_eq!(v.evictable_pages().collect::<Vec<_>>(), vec![1]);
        let span = v.span(0, 3 * PAGE).unwrap();
        assert_eq!(v.missing_pages(span).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(v.signature(span).generations(), &[0, 1, 0]);
        assert_eq!(v.mark_absent(1), Some(PhysHandle::from_raw(5)));
        assert_eq!(v.mark_absent(1), None);
        assert_eq!(v.resident_count, 0);
    }

    #[test]
    fn test_watermark_pages_round_down() {
        let mut v = buffer(8);
        assert_eq!(v.watermark_pages(), None);
        v.watermark_limit = 100 << 20;
        assert_eq!(v.watermark_pages(), Some(3));
    }
}
