//! Strict mode handling for diagnostics.
//!
//! Allows configuration of how diagnostics are treated:
//! - Warn: Just emit the diagnostic
//! - Panic: Emit and then panic (useful for CI)
//!
//! A panic raised from inside one of the `extern "C"` hooks aborts the
//! process, so strict mode is meant for test runs.

use std::sync::atomic::{AtomicU8, Ordering};

use super::kind::DiagnosticKind;

/// Environment variable read by [`init_from_env`].
pub const ENV_STRICT: &str = "TLSFALLOC_STRICT";

/// Strict mode behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StrictMode {
    /// Just warn, don't panic.
    Warn = 0,
    /// Panic on errors.
    PanicOnError = 1,
    /// Panic on errors and warnings.
    PanicOnWarning = 2,
}

impl From<u8> for StrictMode {
    fn from(val: u8) -> Self {
        match val {
            1 => StrictMode::PanicOnError,
            2 => StrictMode::PanicOnWarning,
            _ => StrictMode::Warn,
        }
    }
}

impl StrictMode {
    /// Parse a `TLSFALLOC_STRICT` value.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "0" | "warn" | "false" => Some(StrictMode::Warn),
            "1" | "error" | "true" => Some(StrictMode::PanicOnError),
            "2" | "warning" | "all" => Some(StrictMode::PanicOnWarning),
            _ => None,
        }
    }
}

/// Global strict mode setting.
static STRICT_MODE: AtomicU8 = AtomicU8::new(0);

/// Set the strict mode.
pub fn set_strict_mode(mode: StrictMode) {
    STRICT_MODE.store(mode as u8, Ordering::Relaxed);
}

/// Get the current strict mode.
pub fn strict_mode() -> StrictMode {
    StrictMode::from(STRICT_MODE.load(Ordering::Relaxed))
}

/// Check if a diagnostic of `kind` should panic under the current mode.
pub fn should_panic_for(kind: DiagnosticKind) -> bool {
    match (strict_mode(), kind) {
        (StrictMode::Warn, _) => false,
        (StrictMode::PanicOnError, kind) => kind == DiagnosticKind::Error,
        (StrictMode::PanicOnWarning, kind) => {
            matches!(kind, DiagnosticKind::Error | DiagnosticKind::Warning)
        }
    }
}

/// RAII guard for temporarily setting strict mode.
pub struct StrictModeGuard {
    previous: StrictMode,
}

impl StrictModeGuard {
    /// Create a new guard that sets strict mode.
    pub fn new(mode: StrictMode) -> Self {
        let previous = strict_mode();
        set_strict_mode(mode);
        Self { previous }
    }

    /// Create a guard that enables panic-on-error.
    pub fn panic_on_error() -> Self {
        Self::new(StrictMode::PanicOnError)
    }

    /// Create a guard that enables panic-on-warning.
    pub fn panic_on_warning() -> Self {
        Self::new(StrictMode::PanicOnWarning)
    }
}

impl Drop for StrictModeGuard {
    fn drop(&mut self) {
        set_strict_mode(self.previous);
    }
}

/// Initialize strict mode from the `TLSFALLOC_STRICT` environment variable.
///
/// - "0" or "warn" -> Warn
/// - "1" or "error" -> PanicOnError
/// - "2" or "warning" -> PanicOnWarning
pub fn init_from_env() {
    if let Some(mode) = std::env::var(ENV_STRICT).ok().as_deref().and_then(StrictMode::parse) {
        set_strict_mode(mode);
    }
}
