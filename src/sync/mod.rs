//! Synchronization primitives.
//!
//! Thin wrappers over std or parking_lot mutexes, plus relaxed counters.
//! Nothing in here allocates, so it is usable from inside the allocator.

pub(crate) mod atomics;
pub(crate) mod mutex;
