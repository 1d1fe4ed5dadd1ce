//! Allocation hooks for hosts that take malloc-style function pointers,
//! and a [`GlobalAlloc`] adapter over the base instance.
//!
//! The C-style hooks route to the calling thread's active instance and fall
//! back to the base, creating it with the default config on first use. Blocks
//! are 8-byte aligned, which is what the underlying core guarantees.
//!
//! ```rust,ignore
//! let fns = tlsfalloc::memory_functions();
//! unsafe { host_set_memory_functions(fns.malloc, fns.calloc, fns.realloc, fns.free) };
//! ```

use std::alloc::{GlobalAlloc, Layout};
use std::ffi::c_void;
use std::ptr::{self, NonNull};

use crate::allocators::tlsf::ALIGN_SIZE;
use crate::api::alloc::Arena;
use crate::api::config::ArenaConfig;
use crate::core::directory;

pub type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
pub type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);

/// The four hook entry points, ready to hand to a host.
#[derive(Clone, Copy, Debug)]
pub struct MemoryFunctions {
    pub malloc: MallocFn,
    pub calloc: CallocFn,
    pub realloc: ReallocFn,
    pub free: FreeFn,
}

/// Hook table routed through this crate.
pub fn memory_functions() -> MemoryFunctions {
    MemoryFunctions {
        malloc: tlsf_malloc,
        calloc: tlsf_calloc,
        realloc: tlsf_realloc,
        free: tlsf_free,
    }
}

fn current() -> Option<Arena> {
    directory::active().or_else(directory::base_or_init)
}

/// `malloc` replacement. Null on failure.
///
/// # Safety
///
/// Callable from any thread; the result must be freed with [`tlsf_free`]
/// on a thread whose active instance owns it.
pub unsafe extern "C" fn tlsf_malloc(size: usize) -> *mut c_void {
    match current() {
        Some(arena) => arena.allocate(size).cast(),
        None => ptr::null_mut(),
    }
}

/// `calloc` replacement. Null on failure or if `count * size` overflows.
///
/// # Safety
///
/// See [`tlsf_malloc`].
pub unsafe extern "C" fn tlsf_calloc(count: usize, size: usize) -> *mut c_void {
    match current() {
        Some(arena) => arena.allocate_zeroed(count, size).cast(),
        None => ptr::null_mut(),
    }
}

/// `realloc` replacement. A null `ptr` allocates; a zero `size` keeps a
/// minimum block. On failure null is returned and `ptr` is untouched.
///
/// # Safety
///
/// `ptr` must be null or a live block owned by the active instance.
pub unsafe extern "C" fn tlsf_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    match current() {
        Some(arena) => arena.resize(ptr.cast(), size).cast(),
        None => ptr::null_mut(),
    }
}

/// `free` replacement. Null is ignored.
///
/// # Safety
///
/// `ptr` must be null or a live block owned by the active instance.
pub unsafe extern "C" fn tlsf_free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    if let Some(arena) = current() {
        arena.release(ptr.cast());
    }
}

/// Global allocator backed by the base instance.
///
/// Always uses the base, never the thread's active instance, so blocks the
/// standard library frees on another thread still find their owner. The
/// base is created on the first allocation with this adapter's config, or
/// with whatever an earlier [`init`](crate::init) used. Allocations larger
/// than one region fail, so size `region_size` for the largest allocation
/// the program makes:
///
/// ```rust,ignore
/// #[global_allocator]
/// static GLOBAL: TlsfGlobal = TlsfGlobal::with_config(ArenaConfig::high_capacity());
/// ```
///
/// On macOS enable the `parking_lot` feature: the std mutex there allocates
/// on first lock.
#[derive(Clone, Copy, Debug)]
pub struct TlsfGlobal {
    config: ArenaConfig,
}

impl TlsfGlobal {
    pub const fn new() -> Self {
        Self::with_config(ArenaConfig::new())
    }

    pub const fn with_config(config: ArenaConfig) -> Self {
        Self { config }
    }

    fn base(&self) -> Option<Arena> {
        directory::base().or_else(|| directory::init(&self.config).ok())
    }
}

impl Default for TlsfGlobal {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for TlsfGlobal {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(base) = self.base() else {
            return ptr::null_mut();
        };
        if layout.align() <= ALIGN_SIZE {
            base.allocate(layout.size())
        } else {
            base.allocate_aligned(layout.size(), layout.align())
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            ptr::write_bytes(ptr, 0, layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(base) = directory::base() {
            base.release(ptr);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(base) = directory::base() else {
            return ptr::null_mut();
        };
        if layout.align() <= ALIGN_SIZE {
            return match NonNull::new(ptr) {
                Some(block) => base
                    .try_resize(block, new_size)
                    .map_or(ptr::null_mut(), NonNull::as_ptr),
                None => ptr::null_mut(),
            };
        }

        // The core only keeps 8-byte alignment across a move.
        let fresh = base.allocate_aligned(new_size, layout.align());
        if !fresh.is_null() {
            ptr::copy_nonoverlapping(ptr, fresh, layout.size().min(new_size));
            base.release(ptr);
        }
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hooks_follow_active_instance() {
        let arena = directory::create_instance(&ArenaConfig::minimal()).unwrap();
        directory::set_active(arena).unwrap();
        let fns = memory_functions();
        unsafe {
            let p = (fns.malloc)(100);
            assert!(arena.owns(p.cast()));

            let p = (fns.realloc)(p, 4000);
            assert!(!p.is_null());
            assert!(arena.owns(p.cast()));

            let z = (fns.calloc)(16, 4);
            let zeroed = std::slice::from_raw_parts(z.cast::<u8>(), 64);
            assert!(zeroed.iter().all(|&b| b == 0));

            assert!((fns.calloc)(usize::MAX, 3).is_null());

            (fns.free)(z);
            (fns.free)(p);
            (fns.free)(ptr::null_mut());
        }
        assert_eq!(arena.stats().active_allocations(), 0);

        assert_eq!(directory::rebase_to_base(), Some(arena));
        unsafe { directory::destroy_instance(arena).unwrap() };
    }

    #[test]
    fn test_global_adapter_alignment() {
        let global = TlsfGlobal::new();
        unsafe {
            let layout = Layout::from_size_align(48, 128).unwrap();
            let p = global.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % 128, 0);

            p.write(7);
            let q = global.realloc(p, layout, 4096);
            assert_eq!(q as usize % 128, 0);
            assert_eq!(*q, 7);
            global.dealloc(q, Layout::from_size_align(4096, 128).unwrap());

            let z = global.alloc_zeroed(Layout::from_size_align(32, 8).unwrap());
            assert!(std::slice::from_raw_parts(z, 32).iter().all(|&b| b == 0));
            global.dealloc(z, Layout::from_size_align(32, 8).unwrap());
        }
    }
}
