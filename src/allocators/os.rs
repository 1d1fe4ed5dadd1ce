//! Virtual memory mapping for region backing storage.
//!
//! Regions are requested straight from the OS so that allocator metadata never
//! has to go through a heap. On unix this is anonymous `mmap`; elsewhere the
//! system allocator is called directly (never the global allocator, which may
//! be this crate).

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::util::layout::checked_align_up;

/// Fallback page size when the OS cannot be asked.
const DEFAULT_PAGE_SIZE: usize = 4096;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// OS page size, queried once.
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = query_page_size();
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

#[cfg(unix)]
fn query_page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 && (size as usize).is_power_of_two() {
        size as usize
    } else {
        DEFAULT_PAGE_SIZE
    }
}

#[cfg(not(unix))]
fn query_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

/// Round a byte count up to whole pages.
pub fn page_align(bytes: usize) -> Option<usize> {
    checked_align_up(bytes, page_size())
}

/// A span of page-aligned memory obtained from the OS.
///
/// Not `Drop`: the owner decides when the span goes back via [`unmap`], because
/// spans are recorded inside memory that is itself mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    base: NonNull<u8>,
    len: usize,
}

impl Mapping {
    /// Start of the span.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Length of the span in bytes (a multiple of the page size).
    pub fn len(&self) -> usize {
        self.len
    }
}

/// Map `bytes` (rounded up to whole pages) of zeroed, read-write memory.
///
/// Returns `None` if the OS refuses the request.
pub fn map(bytes: usize) -> Option<Mapping> {
    let len = page_align(bytes.max(1))?;
    // SAFETY: len is non-zero and page aligned.
    let base = unsafe { os_map(len) }?;
    Some(Mapping { base, len })
}

/// Return a span to the OS.
///
/// # Safety
///
/// `mapping` must come from [`map`], must not have been unmapped already, and
/// nothing may touch the span afterwards.
pub unsafe fn unmap(mapping: Mapping) {
    os_unmap(mapping.base, mapping.len);
}

#[cfg(unix)]
unsafe fn os_map(len: usize) -> Option<NonNull<u8>> {
    let ptr = libc::mmap(
        std::ptr::null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        None
    } else {
        NonNull::new(ptr.cast::<u8>())
    }
}

#[cfg(unix)]
unsafe fn os_unmap(base: NonNull<u8>, len: usize) {
    libc::munmap(base.as_ptr().cast(), len);
}

#[cfg(not(unix))]
unsafe fn os_map(len: usize) -> Option<NonNull<u8>> {
    use std::alloc::{GlobalAlloc, Layout, System};

    let layout = Layout::from_size_align(len, page_size()).ok()?;
    NonNull::new(System.alloc_zeroed(layout))
}

#[cfg(not(unix))]
unsafe fn os_unmap(base: NonNull<u8>, len: usize) {
    use std::alloc::{GlobalAlloc, Layout, System};

    if let Ok(layout) = Layout::from_size_align(len, page_size()) {
        System.dealloc(base.as_ptr(), layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert_eq!(page_size(), page_size());
    }

    #[test]
    fn test_map_rounds_to_pages() {
        let mapping = map(10).expect("map failed");
        assert_eq!(mapping.len(), page_size());
        assert_eq!(mapping.base().as_ptr() as usize % page_size(), 0);

        // Fresh mappings are zeroed and writable.
        unsafe {
            let bytes = std::slice::from_raw_parts_mut(mapping.base().as_ptr(), mapping.len());
            assert!(bytes.iter().all(|&b| b == 0));
            bytes[0] = 0xAB;
            bytes[mapping.len() - 1] = 0xCD;
            unmap(mapping);
        }
    }

    #[test]
    fn test_page_align_overflow() {
        assert_eq!(page_align(usize::MAX), None);
    }
}
