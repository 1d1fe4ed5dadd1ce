//! The arena handle.

use std::fmt;
use std::ptr::{self, NonNull};

use crate::allocators::tlsf::ALIGN_SIZE;
use crate::api::config::ArenaConfig;
use crate::api::error::{ArenaError, Integrity};
use crate::api::stats::{ArenaStats, RegionSummary};
use crate::api::wrappers::ArenaBox;
use crate::core::directory;
use crate::core::instance::InstanceBlock;

/// Handle to one allocator instance.
///
/// Handles are plain copies of a pointer to the instance control block. They
/// stay valid until the instance is destroyed (see
/// [`destroy_instance`](crate::destroy_instance) and
/// [`shutdown`](crate::shutdown)); using one after that is undefined.
///
/// Every operation locks the instance for its duration, so a handle can be
/// shared freely between threads.
///
/// ```rust,ignore
/// use tlsfalloc::{create_instance, ArenaConfig};
///
/// let arena = create_instance(&ArenaConfig::minimal())?;
/// let p = arena.allocate(128);
/// unsafe { arena.release(p) };
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Arena {
    block: NonNull<InstanceBlock>,
}

// SAFETY: InstanceBlock is Send + Sync and outlives every handle by contract.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub(crate) fn from_block(block: NonNull<InstanceBlock>) -> Self {
        Self { block }
    }

    pub(crate) fn block(&self) -> NonNull<InstanceBlock> {
        self.block
    }

    fn inner(&self) -> &InstanceBlock {
        // SAFETY: handles never outlive their instance (see type docs).
        unsafe { self.block.as_ref() }
    }

    /// Create an independent instance; same as [`create_instance`](crate::create_instance).
    pub fn create(config: &ArenaConfig) -> Result<Self, ArenaError> {
        directory::create_instance(config)
    }

    /// Instance id, as seen in events, stats and diagnostics.
    pub fn id(&self) -> u64 {
        self.inner().id()
    }

    pub fn config(&self) -> ArenaConfig {
        *self.inner().config()
    }

    /// Largest request a single region can satisfy.
    ///
    /// Slightly below the region's free payload: requests are rounded up to
    /// a size class before the search. Aligned requests also need room for
    /// the alignment padding. Anything larger fails with
    /// [`ArenaError::TooLarge`] without mapping a region.
    pub fn region_capacity(&self) -> usize {
        self.inner().region_capacity()
    }

    pub fn region_count(&self) -> usize {
        self.inner().region_count()
    }

    // ==================== Allocation ====================

    /// Allocate `size` bytes aligned to 8. Null on failure.
    ///
    /// A zero-byte request returns the smallest block.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        self.try_allocate(size)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Allocate `size` bytes aligned to 8.
    pub fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, ArenaError> {
        self.inner().allocate(size, ALIGN_SIZE)
    }

    /// Allocate `size` bytes aligned to `align`. Null on failure.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> *mut u8 {
        self.try_allocate_aligned(size, align)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Allocate `size` bytes aligned to `align`, which must be a power of two.
    pub fn try_allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, ArenaError> {
        if !align.is_power_of_two() {
            return Err(ArenaError::InvalidAlignment { align });
        }
        self.inner().allocate(size, align.max(ALIGN_SIZE))
    }

    /// Allocate `count * elem_size` zeroed bytes. Null on failure or overflow.
    pub fn allocate_zeroed(&self, count: usize, elem_size: usize) -> *mut u8 {
        self.try_allocate_zeroed(count, elem_size)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Allocate `count * elem_size` zeroed bytes.
    ///
    /// An overflowing product is reported as [`ArenaError::TooLarge`] with
    /// `requested` saturated to `usize::MAX`.
    pub fn try_allocate_zeroed(&self, count: usize, elem_size: usize) -> Result<NonNull<u8>, ArenaError> {
        let Some(size) = count.checked_mul(elem_size) else {
            return Err(ArenaError::TooLarge {
                requested: usize::MAX,
                limit: self.region_capacity(),
            });
        };
        let block = self.try_allocate(size)?;
        // The block is ours alone; zero it outside the instance lock.
        unsafe { ptr::write_bytes(block.as_ptr(), 0, size) };
        Ok(block)
    }

    /// Resize a block, moving it if it cannot grow in place.
    ///
    /// A null `ptr` allocates. On failure null is returned and the original
    /// block is untouched and still owned by the caller.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must be a live allocation from this arena. If the
    /// result differs from `ptr`, `ptr` is no longer valid.
    pub unsafe fn resize(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        match NonNull::new(ptr) {
            Some(block) => self
                .try_resize(block, size)
                .map_or(ptr::null_mut(), NonNull::as_ptr),
            None => self.allocate(size),
        }
    }

    /// Resize a block, moving it if it cannot grow in place.
    ///
    /// The first `min(old, size)` bytes are preserved. Resizing to zero keeps
    /// a minimum block rather than releasing.
    ///
    /// # Safety
    ///
    /// See [`Arena::resize`].
    pub unsafe fn try_resize(&self, ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>, ArenaError> {
        self.inner().resize(ptr, size)
    }

    /// Return a block to the arena. Null is ignored.
    ///
    /// Pointers outside every region of this arena are reported (TA202) and
    /// otherwise ignored. That check is a courtesy, not a guarantee.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must be a live allocation from this arena and must
    /// not be used afterwards. Releasing a block twice, or releasing a
    /// pointer that lies inside a region but was not returned by this arena,
    /// is undefined behavior and corrupts the free lists.
    pub unsafe fn release(&self, ptr: *mut u8) {
        if let Some(block) = NonNull::new(ptr) {
            let _ = self.try_release(block);
        }
    }

    /// Return a block to the arena.
    ///
    /// # Safety
    ///
    /// See [`Arena::release`].
    pub unsafe fn try_release(&self, ptr: NonNull<u8>) -> Result<(), ArenaError> {
        self.inner().release(ptr)
    }

    /// Bytes actually usable at `ptr`, or `None` if the arena does not own it.
    ///
    /// # Safety
    ///
    /// If owned, `ptr` must be a live allocation.
    pub unsafe fn usable_size(&self, ptr: *const u8) -> Option<usize> {
        self.inner().usable_size(NonNull::new(ptr.cast_mut())?)
    }

    /// Move `value` into a block owned by this arena.
    pub fn boxed<T>(&self, value: T) -> Result<ArenaBox<T>, ArenaError> {
        ArenaBox::new_in(value, *self)
    }

    // ==================== Introspection ====================

    /// Whether `ptr` lies inside one of this arena's regions.
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.resolve(ptr).is_some()
    }

    /// The region holding `ptr`.
    pub fn resolve(&self, ptr: *const u8) -> Option<RegionSummary> {
        self.inner().resolve(ptr as usize)
    }

    /// Walk every region and free list and cross-check the counters.
    ///
    /// Emits TA201 on failure. Holds the instance lock for the whole walk.
    pub fn integrity_check(&self) -> Integrity {
        self.inner().integrity_check()
    }

    /// One row per region, in table order.
    pub fn region_dump(&self) -> Vec<RegionSummary> {
        self.inner().region_dump()
    }

    pub fn stats(&self) -> ArenaStats {
        self.inner().stats()
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena").field("id", &self.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scoped(Arena);

    impl Scoped {
        fn new() -> Self {
            Self(directory::create_instance(&ArenaConfig::minimal()).expect("create"))
        }
    }

    impl Drop for Scoped {
        fn drop(&mut self) {
            unsafe { directory::destroy_instance(self.0).expect("destroy") };
        }
    }

    #[test]
    fn test_null_is_ignored() {
        let scoped = Scoped::new();
        let arena = scoped.0;
        let before = arena.stats();
        unsafe {
            arena.release(ptr::null_mut());
            assert!(arena.usable_size(ptr::null()).is_none());
        }
        assert_eq!(arena.stats().release_count, before.release_count);
    }

    #[test]
    fn test_resize_null_allocates() {
        let scoped = Scoped::new();
        let arena = scoped.0;
        unsafe {
            let p = arena.resize(ptr::null_mut(), 100);
            assert!(!p.is_null());
            assert!(arena.owns(p));
            assert!(arena.usable_size(p).unwrap() >= 100);
            arena.release(p);
        }
    }

    #[test]
    fn test_zeroed_overflow_is_null() {
        let scoped = Scoped::new();
        assert!(scoped.0.allocate_zeroed(usize::MAX, 2).is_null());
        assert!(matches!(
            scoped.0.try_allocate_zeroed(usize::MAX, 2),
            Err(ArenaError::TooLarge { requested: usize::MAX, .. })
        ));
    }

    #[test]
    fn test_zeroed_block_is_zero() {
        let scoped = Scoped::new();
        let arena = scoped.0;
        let p = arena.allocate(256);
        unsafe {
            ptr::write_bytes(p, 0xAB, 256);
            arena.release(p);
        }
        let z = arena.allocate_zeroed(32, 8);
        let bytes = unsafe { std::slice::from_raw_parts(z, 256) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { arena.release(z) };
    }

    #[test]
    fn test_bad_alignment_rejected() {
        let scoped = Scoped::new();
        assert_eq!(
            scoped.0.try_allocate_aligned(64, 24),
            Err(ArenaError::InvalidAlignment { align: 24 })
        );
        assert!(scoped.0.allocate_aligned(64, 0).is_null());
    }

    #[test]
    fn test_foreign_pointer_not_owned() {
        let scoped = Scoped::new();
        let local = 5u64;
        assert!(!scoped.0.owns(&local as *const u64 as *const u8));
        let mut other = 0u8;
        let err = unsafe { scoped.0.try_release(NonNull::from(&mut other)) };
        assert_eq!(err, Err(ArenaError::ForeignPointer));
    }

    #[test]
    fn test_debug_shows_id() {
        let scoped = Scoped::new();
        let shown = format!("{:?}", scoped.0);
        assert!(shown.contains(&scoped.0.id().to_string()));
    }
}
