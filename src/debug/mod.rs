//! Debug utilities.
//!
//! Poisoning is switched per arena by `ArenaConfig::poison_on_release`, which
//! defaults to on when the `debug` feature is enabled.

pub mod poison;
