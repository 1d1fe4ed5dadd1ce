//! Diagnostic emission backend.
//!
//! Handles outputting diagnostics to stderr, logs, or custom sinks.
//!
//! Emission may run while this crate is the global allocator, so it is never
//! done with an instance lock held, and a thread that is already emitting
//! drops any diagnostic raised by its own output path (a logger that
//! allocates, for example).

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::kind::{Diagnostic, DiagnosticKind};
use super::strict::should_panic_for;
use crate::sync::mutex::Mutex;

/// Global flag to suppress diagnostic output (for testing).
static DIAGNOSTICS_SUPPRESSED: AtomicBool = AtomicBool::new(false);

/// Global flag to enable verbose diagnostics.
static VERBOSE_DIAGNOSTICS: AtomicBool = AtomicBool::new(false);

/// Optional user sink, fed after stderr and log.
static SINK: Mutex<Option<Arc<dyn DiagnosticSink>>> = Mutex::new(None);

thread_local! {
    static EMITTING: Cell<bool> = const { Cell::new(false) };
}

/// Suppress all diagnostic output.
pub fn suppress_diagnostics(suppress: bool) {
    DIAGNOSTICS_SUPPRESSED.store(suppress, Ordering::Relaxed);
}

/// Enable verbose diagnostic output.
pub fn set_verbose(verbose: bool) {
    VERBOSE_DIAGNOSTICS.store(verbose, Ordering::Relaxed);
}

/// Check if diagnostics are suppressed.
pub fn is_suppressed() -> bool {
    DIAGNOSTICS_SUPPRESSED.load(Ordering::Relaxed)
}

/// Route every diagnostic to `sink` as well.
pub fn install_sink(sink: Arc<dyn DiagnosticSink>) {
    *SINK.lock() = Some(sink);
}

/// Remove the installed sink, if any.
pub fn remove_sink() -> Option<Arc<dyn DiagnosticSink>> {
    SINK.lock().take()
}

/// Marks the current thread as emitting until dropped.
pub(crate) struct EmitGuard(());

impl EmitGuard {
    /// `None` if this thread is already emitting.
    pub(crate) fn enter() -> Option<Self> {
        let entered = EMITTING
            .try_with(|flag| !flag.replace(true))
            .unwrap_or(false);
        entered.then_some(Self(()))
    }
}

impl Drop for EmitGuard {
    fn drop(&mut self) {
        let _ = EMITTING.try_with(|flag| flag.set(false));
    }
}

/// Emit a diagnostic.
///
/// Goes to stderr in debug builds or with the `diagnostics` feature, to the
/// `log` crate with the `log` feature, and to the installed sink.
pub fn emit(diag: &Diagnostic) {
    if let Some(_guard) = EmitGuard::enter() {
        emit_unguarded(diag, None);
    }
}

/// Emit a diagnostic with additional runtime context.
pub fn emit_with_context(diag: &Diagnostic, context: fmt::Arguments<'_>) {
    if let Some(_guard) = EmitGuard::enter() {
        emit_unguarded(diag, Some(context));
    }
}

/// Emit while the caller already holds an [`EmitGuard`].
pub(crate) fn emit_unguarded(diag: &Diagnostic, context: Option<fmt::Arguments<'_>>) {
    if is_suppressed() {
        return;
    }

    #[cfg(any(debug_assertions, feature = "diagnostics"))]
    emit_to_stderr(diag, context);

    #[cfg(feature = "log")]
    emit_to_log(diag, context);

    let sink = SINK.lock().clone();
    if let Some(sink) = sink {
        sink.emit(diag);
    }

    if should_panic_for(diag.kind) {
        panic!(
            "[tlsfalloc][{}] {}\nStrict mode enabled - diagnostics are fatal.",
            diag.code, diag.message
        );
    }
}

/// Internal: emit to stderr.
#[cfg(any(debug_assertions, feature = "diagnostics"))]
fn emit_to_stderr(diag: &Diagnostic, context: Option<fmt::Arguments<'_>>) {
    use std::io::Write;

    let mut stderr = std::io::stderr().lock();
    let verbose = VERBOSE_DIAGNOSTICS.load(Ordering::Relaxed);

    let _ = writeln!(
        stderr,
        "[tlsfalloc][{}] {}: {}",
        diag.code,
        diag.kind.prefix(),
        diag.message
    );

    if let Some(context) = context {
        let _ = writeln!(stderr, "  context: {}", context);
    }
    if let Some(note) = diag.note {
        let _ = writeln!(stderr, "  note: {}", note);
    }
    if let Some(help) = diag.help {
        let _ = writeln!(stderr, "  help: {}", help);
    }

    if verbose && diag.kind == DiagnosticKind::Error {
        let _ = writeln!(stderr, "  hint: set RUST_BACKTRACE=1 for a backtrace");
    }

    let _ = writeln!(stderr);
}

/// Emit a diagnostic using the log crate.
#[cfg(feature = "log")]
fn emit_to_log(diag: &Diagnostic, context: Option<fmt::Arguments<'_>>) {
    let level = match diag.kind {
        DiagnosticKind::Error => log::Level::Error,
        DiagnosticKind::Warning => log::Level::Warn,
        DiagnosticKind::Note | DiagnosticKind::Help => log::Level::Info,
    };

    match context {
        Some(context) => log::log!(level, "[{}] {} ({})", diag.code, diag.message, context),
        None => log::log!(level, "[{}] {}", diag.code, diag.message),
    }

    if let Some(note) = diag.note {
        log::info!("  note: {}", note);
    }
    if let Some(help) = diag.help {
        log::info!("  help: {}", help);
    }
}

/// A diagnostic sink trait for custom output.
pub trait DiagnosticSink: Send + Sync {
    /// Handle a diagnostic.
    fn emit(&self, diag: &Diagnostic);
}

/// A simple sink that collects diagnostics.
#[derive(Default)]
pub struct CollectingSink {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    /// Create a new collecting sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected diagnostics.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }

    /// Codes of all collected diagnostics, in order.
    pub fn codes(&self) -> Vec<&'static str> {
        self.diagnostics.lock().iter().map(|d| d.code).collect()
    }

    /// Clear collected diagnostics.
    pub fn clear(&self) {
        self.diagnostics.lock().clear();
    }

    /// Check if any errors were collected.
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .lock()
            .iter()
            .any(|d| d.kind == DiagnosticKind::Error)
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, diag: &Diagnostic) {
        self.diagnostics.lock().push(diag.clone());
    }
}
