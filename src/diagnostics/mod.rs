//! Diagnostics: coded messages, strict mode, and the event journal.
//!
//! ## Diagnostic Codes
//!
//! | Code  | Meaning                        |
//! |-------|--------------------------------|
//! | TA0xx | Capacity and growth            |
//! | TA1xx | Instance directory misuse      |
//! | TA2xx | Integrity and ownership        |
//! | TA9xx | Internal errors                |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tlsfalloc::diagnostics::{install_sink, CollectingSink};
//! use std::sync::Arc;
//!
//! let sink = Arc::new(CollectingSink::new());
//! install_sink(sink.clone());
//! // ... run allocations ...
//! assert!(!sink.has_errors());
//! ```

pub mod emit;
pub mod events;
pub mod kind;
pub mod macros;
pub mod strict;

pub use emit::{
    emit, emit_with_context, install_sink, remove_sink, set_verbose, suppress_diagnostics,
    CollectingSink, DiagnosticSink,
};
pub use events::{drain_events, ArenaEvent, JOURNAL_CAPACITY};
pub use kind::{Diagnostic, DiagnosticKind};
pub use strict::{init_from_env, set_strict_mode, strict_mode, StrictMode, StrictModeGuard};

// Re-export predefined diagnostics
pub use kind::{TA001, TA002, TA003, TA004, TA101, TA102, TA103, TA104, TA201, TA202, TA901};
