//! Build script for tlsfalloc.
//!
//! Prints short notes about the enabled features.

use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_DEBUG");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_PARKING_LOT");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_DIAGNOSTICS");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_LOG");

    let debug_enabled = env::var("CARGO_FEATURE_DEBUG").is_ok();
    let parking_lot_enabled = env::var("CARGO_FEATURE_PARKING_LOT").is_ok();
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let is_release = profile == "release";
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();

    if debug_enabled && is_release {
        emit_warning("'debug' enabled in a release build: released blocks are poisoned with 0xCD");
    }

    // The std mutex on macOS boxes its pthread mutex on first lock, which
    // re-enters the allocator when this crate is the global allocator.
    if target_os == "macos" && !parking_lot_enabled {
        emit_note("using tlsfalloc as the global allocator on macOS requires the 'parking_lot' feature");
    }
}

fn emit_note(msg: &str) {
    println!("cargo:warning=[tlsfalloc] {}", msg);
}

fn emit_warning(msg: &str) {
    println!("cargo:warning=[tlsfalloc] warning: {}", msg);
}
