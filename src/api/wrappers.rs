//! Owning wrappers over arena allocations.

use std::fmt;
use std::mem::{self, align_of, size_of};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::api::alloc::Arena;
use crate::api::error::ArenaError;

/// A Box-like wrapper for a value stored in an [`Arena`].
///
/// The value is dropped and its block released when the box is dropped.
///
/// # Example
///
/// ```rust,ignore
/// let arena = tlsfalloc::create_instance(&ArenaConfig::minimal())?;
///
/// {
///     let data = arena.boxed([0u64; 64])?;
///     println!("{}", data[0]);
/// } // data is released here
/// ```
pub struct ArenaBox<T> {
    ptr: NonNull<T>,
    arena: Arena,
}

impl<T> ArenaBox<T> {
    /// Move `value` into a block from `arena`.
    pub fn new_in(value: T, arena: Arena) -> Result<Self, ArenaError> {
        let block = arena.try_allocate_aligned(size_of::<T>(), align_of::<T>())?;
        let ptr = block.cast::<T>();
        // SAFETY: the block is fresh, large enough and aligned for T.
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self { ptr, arena })
    }

    /// Arena the value lives in.
    pub fn arena(&self) -> Arena {
        self.arena
    }

    /// Get the raw pointer.
    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }

    /// Get the raw mutable pointer.
    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Leak the box, returning the raw pointer.
    ///
    /// The caller must drop the value and release the block through the
    /// same arena.
    pub fn into_raw(self) -> *mut T {
        let ptr = self.ptr.as_ptr();
        mem::forget(self);
        ptr
    }
}

impl<T> Deref for ArenaBox<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for ArenaBox<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T: fmt::Debug> fmt::Debug for ArenaBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T> Drop for ArenaBox<T> {
    fn drop(&mut self) {
        unsafe {
            std::ptr::drop_in_place(self.ptr.as_ptr());
            self.arena.release(self.ptr.as_ptr().cast());
        }
    }
}

// Safety: ArenaBox owns its value exclusively; the arena is Send + Sync.
unsafe impl<T: Send> Send for ArenaBox<T> {}
unsafe impl<T: Sync> Sync for ArenaBox<T> {}
