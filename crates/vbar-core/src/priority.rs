//! Device-wide eviction order.

use crate::vbar::VbarId;
use std::collections::VecDeque;

/// Buffers of one device ordered from evicted-first to evicted-last.
///
/// New buffers enter at the evicted-last end, as if just prioritized.
#[derive(Debug, Default)]
pub(crate) struct PriorityList {
    order: VecDeque<VbarId>,
}

impl PriorityList {
    pub(crate) fn insert(&mut self, id: VbarId) {
        self.remove(id);
        self.order.push_back(id);
    }

    pub(crate) fn remove(&mut self, id: VbarId) -> bool {
        match self.order.iter().position(|&v| v == id) {
            Some(pos) => {
                self.order.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Move to the evicted-last end.
    pub(crate) fn prioritize(&mut self, id: VbarId) -> bool {
        let present = self.remove(id);
        if present {
            self.order.push_back(id);
        }
        present
    }

    /// Move to the evicted-first end.
    pub(crate) fn deprioritize(&mut self, id: VbarId) -> bool {
        let present = self.remove(id);
        if present {
            self.order.push_front(id);
        }
        present
    }

    /// 0 for the buffer evicted first.
    pub(crate) fn rank(&self, id: VbarId) -> Option<usize> {
        self.order.iter().position(|&v| v == id)
    }

    /// Buffers in the order a sweep visits them.
    pub(crate) fn eviction_order(&self) -> impl Iterator<Item = VbarId> + '_ {
        self.order.iter().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}
