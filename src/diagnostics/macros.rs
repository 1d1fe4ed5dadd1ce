//! Diagnostic macros.
//!
//! These macros provide a clean, rustc-like diagnostic experience.

/// Emit a predefined diagnostic by code, optionally with formatted context.
///
/// # Example
///
/// ```rust,ignore
/// ta_emit!(TA001);
/// ta_emit!(TA003, "instance {}: {} bytes", id, size);
/// ```
#[macro_export]
macro_rules! ta_emit {
    ($code:ident) => {{
        $crate::diagnostics::emit::emit(&$crate::diagnostics::$code);
    }};
    ($code:ident, $($arg:tt)+) => {{
        $crate::diagnostics::emit::emit_with_context(
            &$crate::diagnostics::$code,
            format_args!($($arg)+),
        );
    }};
}
