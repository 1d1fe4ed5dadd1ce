//! Atomic identifier counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing atomic counter.
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create a new counter.
    pub const fn new(initial: u64) -> Self {
        Self(AtomicU64::new(initial))
    }

    /// Return the current value and advance by one.
    ///
    /// Used to hand out identifiers; only uniqueness matters, not ordering
    /// relative to other memory operations.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}
