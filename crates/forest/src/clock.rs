//! Forest-wide logical clock.

use canopy_core::message::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter shared by every node, so timestamps compare across trees.
#[derive(Debug, Default)]
pub struct LogicalClock {
    last: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start after an already-issued timestamp (used on restore).
    pub fn starting_at(last: Timestamp) -> Self {
        Self {
            last: AtomicU64::new(last.0),
        }
    }

    /// Issue the next timestamp.
    pub fn tick(&self) -> Timestamp {
        Timestamp(self.last.fetch_add(1, Ordering::SeqCst).saturating_add(1))
    }

    /// Advance to at least `ts` after an externally supplied timestamp.
    pub fn observe(&self, ts: Timestamp) {
        self.last.fetch_max(ts.0, Ordering::SeqCst);
    }

    /// The most recently issued or observed timestamp.
    pub fn now(&self) -> Timestamp {
        Timestamp(self.last.load(Ordering::SeqCst))
    }
}
