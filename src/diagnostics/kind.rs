//! Diagnostic kinds and predefined diagnostics.
//!
//! Mirrors rustc's diagnostic levels for familiar UX.

/// The severity level of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A hard error - something is definitely wrong.
    Error,
    /// A warning - something is probably wrong or suboptimal.
    Warning,
    /// Additional context about another diagnostic.
    Note,
    /// Actionable suggestion to fix the issue.
    Help,
}

impl DiagnosticKind {
    /// Get the display prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::Note => "note",
            DiagnosticKind::Help => "help",
        }
    }
}

/// A diagnostic message with code, message, and optional context.
///
/// Diagnostic codes follow the pattern:
/// - `TA0xx` - Capacity and growth
/// - `TA1xx` - Instance directory misuse
/// - `TA2xx` - Integrity and ownership
/// - `TA9xx` - Internal errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Severity level.
    pub kind: DiagnosticKind,
    /// Diagnostic code (e.g., "TA001").
    pub code: &'static str,
    /// Primary message.
    pub message: &'static str,
    /// Optional additional context.
    pub note: Option<&'static str>,
    /// Optional fix suggestion.
    pub help: Option<&'static str>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub const fn error(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Create a new warning diagnostic.
    pub const fn warning(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Add a note to this diagnostic.
    pub const fn with_note(mut self, note: &'static str) -> Self {
        self.note = Some(note);
        self
    }

    /// Add a help message to this diagnostic.
    pub const fn with_help(mut self, help: &'static str) -> Self {
        self.help = Some(help);
        self
    }
}

// =============================================================================
// Predefined diagnostics (TA0xx - Capacity)
// =============================================================================

/// TA001: Request larger than one region.
pub const TA001: Diagnostic = Diagnostic::warning(
    "TA001",
    "allocation larger than one region, request refused"
).with_note("a block can never span two regions")
 .with_help("increase region_size in ArenaConfig, or split the allocation");

/// TA002: The OS refused a region mapping.
pub const TA002: Diagnostic = Diagnostic::warning(
    "TA002",
    "OS refused to map a new region"
).with_note("growth failed; the request is reported as out of memory")
 .with_help("check the process address-space and overcommit limits");

/// TA003: Growth and the retry both failed.
pub const TA003: Diagnostic = Diagnostic::warning(
    "TA003",
    "arena exhausted, allocation failed after growing"
).with_note("free space is fragmented or the OS refused more memory")
 .with_help("release long-lived blocks that pin regions, or use larger regions");

/// TA004: Region limit reached.
pub const TA004: Diagnostic = Diagnostic::warning(
    "TA004",
    "arena reached its region limit"
).with_help("raise max_regions (up to 256) or region_size in ArenaConfig");

// =============================================================================
// Predefined diagnostics (TA1xx - Instance directory)
// =============================================================================

/// TA101: Destroying the calling thread's active instance.
pub const TA101: Diagnostic = Diagnostic::error(
    "TA101",
    "cannot destroy an instance that is active on this thread"
).with_help("call rebase_to_base() before destroy_instance()");

/// TA102: Destroying the base instance.
pub const TA102: Diagnostic = Diagnostic::error(
    "TA102",
    "the base instance cannot be destroyed directly"
).with_note("the base instance lives until shutdown()");

/// TA103: Unknown instance handle.
pub const TA103: Diagnostic = Diagnostic::error(
    "TA103",
    "handle does not name a live instance"
).with_note("the instance was already destroyed or belongs to a previous init()");

/// TA104: Too many live instances.
pub const TA104: Diagnostic = Diagnostic::warning(
    "TA104",
    "instance directory is full"
).with_help("destroy unused instances before creating new ones");

// =============================================================================
// Predefined diagnostics (TA2xx - Integrity)
// =============================================================================

/// TA201: Integrity check failed.
pub const TA201: Diagnostic = Diagnostic::error(
    "TA201",
    "arena integrity check failed"
).with_note("block headers or free lists are inconsistent; the instance cannot be trusted")
 .with_help("tear the instance down; look for double frees or buffer overruns");

/// TA202: Pointer not owned by the instance.
pub const TA202: Diagnostic = Diagnostic::error(
    "TA202",
    "pointer does not belong to any region of this instance"
).with_note("memory must be released through the instance that allocated it")
 .with_help("switch to the allocating instance with set_active() before releasing");

// =============================================================================
// Predefined diagnostics (TA9xx - Internal)
// =============================================================================

/// TA901: Internal allocator error.
pub const TA901: Diagnostic = Diagnostic::error(
    "TA901",
    "internal allocator error"
).with_note("a block was placed outside every region of its instance")
 .with_help("please report this issue at the tlsfalloc repository");
