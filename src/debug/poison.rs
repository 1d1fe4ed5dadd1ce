//! Memory poisoning for debugging.
//!
//! Fills released memory with a known pattern to expose use-after-free.

/// Pattern used to poison released memory.
pub const FREED_PATTERN: u8 = 0xCD;

/// Poison a region of memory with the freed pattern.
///
/// # Safety
///
/// The memory region must be valid and writable.
pub(crate) unsafe fn poison_freed(ptr: *mut u8, size: usize) {
    std::ptr::write_bytes(ptr, FREED_PATTERN, size);
}

/// Check if a region appears to be poisoned with the freed pattern.
///
/// # Safety
///
/// The memory region must be valid and readable.
pub unsafe fn is_freed_poison(ptr: *const u8, size: usize) -> bool {
    std::slice::from_raw_parts(ptr, size)
        .iter()
        .all(|&byte| byte == FREED_PATTERN)
}
