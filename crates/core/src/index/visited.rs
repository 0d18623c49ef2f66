//! Epoch-stamped visited marks for graph traversal.
//!
//! `reset()` bumps the epoch instead of zeroing the marks, so a traversal costs
//! nothing up front no matter how large the index is.

/// Visited marks keyed by slot number.
#[derive(Debug, Default)]
pub struct VisitedMarks {
    marks: Vec<u32>,
    epoch: u32,
}

impl VisitedMarks {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            marks: vec![0; capacity],
            epoch: 1,
        }
    }

    /// Forget every mark. Full zeroing only happens when the epoch wraps.
    pub fn reset(&mut self) {
        if self.epoch == u32::MAX {
            self.marks.fill(0);
            self.epoch = 1;
        } else {
            self.epoch += 1;
        }
    }

    /// Grow to cover `capacity` slots.
    pub fn reserve_slots(&mut self, capacity: usize) {
        if capacity > self.marks.len() {
            self.marks.resize(capacity, 0);
        }
        if self.epoch == 0 {
            self.epoch = 1;
        }
    }

    /// Mark `slot`; returns `true` the first time it is seen in this epoch.
    #[inline]
    pub fn visit(&mut self, slot: u32) -> bool {
        let mark = &mut self.marks[slot as usize];
        if *mark == self.epoch {
            false
        } else {
            *mark = self.epoch;
            true
        }
    }
}
