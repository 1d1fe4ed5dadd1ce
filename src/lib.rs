//! # tlsfalloc
//!
//! Two-level segregated fit allocation over growable, self-shrinking arenas.
//!
//! ## Features
//!
//! - O(1) allocate, release and resize with bounded fragmentation
//! - Arenas that map new regions from the OS on demand and unmap them once empty
//! - Any number of independent instances, plus a lazily created base
//! - Per-thread active instance for malloc-style hooks
//! - A [`GlobalAlloc`](std::alloc::GlobalAlloc) adapter over the base
//! - Integrity checks, region dumps and statistics
//! - Coded diagnostics with strict mode and an event journal
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tlsfalloc::{create_instance, destroy_instance, ArenaConfig};
//!
//! let arena = create_instance(&ArenaConfig::minimal()).unwrap();
//!
//! let p = arena.allocate(200 * 1024);
//! unsafe { arena.release(p) };
//!
//! unsafe { destroy_instance(arena).unwrap() };
//! ```
//!
//! ## As the global allocator
//!
//! ```rust,ignore
//! #[global_allocator]
//! static GLOBAL: tlsfalloc::TlsfGlobal = tlsfalloc::TlsfGlobal::new();
//! ```
//!
//! On macOS the std mutex allocates on first lock; enable the `parking_lot`
//! feature there.
//!
//! ## Concurrency
//!
//! Each instance is guarded by a single lock held for the whole of every
//! operation. Threads contending on one instance serialize; give hot threads
//! their own instance and [`set_active`] it.

pub mod api;
pub mod debug;
pub mod diagnostics;

mod allocators;
mod core;
mod sync;
mod util;

// Re-export public API at crate root for convenience
pub use api::alloc::Arena;
pub use api::config::{ArenaConfig, ENV_INITIAL_CAPACITY, ENV_REGION_SIZE};
pub use api::error::{ArenaError, Corruption, Integrity};
pub use api::hooks::{
    memory_functions, tlsf_calloc, tlsf_free, tlsf_malloc, tlsf_realloc, MemoryFunctions, TlsfGlobal,
};
pub use api::stats::{ArenaStats, RegionSummary};
pub use api::wrappers::ArenaBox;

// Instance directory
pub use crate::core::directory::{
    active, base, create_instance, destroy_instance, init, instance_count, rebase_to_base,
    set_active, shutdown, MAX_INSTANCES,
};

pub use allocators::region::MAX_REGIONS;
pub use allocators::tlsf::{ALIGN_SIZE, BLOCK_SIZE_MAX};
pub use util::size::{format_bytes, kb, mb, parse_bytes};

// Diagnostics
pub use diagnostics::{drain_events, ArenaEvent};
pub use diagnostics::{Diagnostic, DiagnosticKind};
pub use diagnostics::{set_strict_mode, StrictMode, StrictModeGuard};
pub use diagnostics::{TA001, TA002, TA003, TA004, TA101, TA102, TA103, TA104, TA201, TA202, TA901};
