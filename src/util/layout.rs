//! Alignment arithmetic.
//!
//! All alignments are powers of two.

/// Align a size up to the given alignment.
#[inline]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Align a size down to the given alignment.
#[inline]
pub const fn align_down(size: usize, align: usize) -> usize {
    size - (size & (align - 1))
}

/// Align an address up, returning `None` on overflow.
#[inline]
pub const fn checked_align_up(size: usize, align: usize) -> Option<usize> {
    match size.checked_add(align - 1) {
        Some(sum) => Some(sum & !(align - 1)),
        None => None,
    }
}

/// Align a pointer up to the given alignment.
#[inline]
pub fn align_ptr(ptr: *mut u8, align: usize) -> *mut u8 {
    let addr = ptr as usize;
    let aligned = align_up(addr, align);
    ptr.wrapping_add(aligned - addr)
}

/// Whether `addr` is a multiple of `align`.
#[inline]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & (align - 1) == 0
}
