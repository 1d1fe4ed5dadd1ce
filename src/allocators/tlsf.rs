//! Two-level segregated fit (TLSF) allocation core.
//!
//! Free blocks are bucketed by a first-level index (power-of-two class) and a
//! second-level index (linear subdivision of that class). Two bitmaps record
//! which buckets are non-empty, so finding a block is a couple of bit scans no
//! matter how full the heap is.
//!
//! ```text
//!  region start                                                region end
//!  |                                                                  |
//!  [prev|size|payload ........][prev|size|payload ....] ... [prev|size=0]
//!        ^ block header           ^ prev is only valid when           ^ sentinel
//!                                   the previous block is free
//! ```
//!
//! Every block stores its size and two flag bits (`free`, `prev free`). A free
//! block additionally stores its free-list links in its payload and publishes
//! its own address in the first word of its physical successor, which is how
//! `release` finds the previous neighbour without scanning anything.
//!
//! The core knows nothing about who owns a region; it only stitches registered
//! spans into one set of free lists. Blocks never span regions because each
//! region ends in a zero-sized used sentinel.

use std::mem::size_of;
use std::ptr::{self, NonNull};

use crate::util::layout::{align_down, align_ptr, align_up, is_aligned};

#[cfg(target_pointer_width = "64")]
const ALIGN_SIZE_LOG2: usize = 3;
#[cfg(not(target_pointer_width = "64"))]
const ALIGN_SIZE_LOG2: usize = 2;

/// Natural alignment of every pointer handed out by the core.
pub const ALIGN_SIZE: usize = 1 << ALIGN_SIZE_LOG2;

const SL_INDEX_COUNT_LOG2: usize = 5;
const SL_INDEX_COUNT: usize = 1 << SL_INDEX_COUNT_LOG2;

#[cfg(target_pointer_width = "64")]
const FL_INDEX_MAX: usize = 32;
#[cfg(not(target_pointer_width = "64"))]
const FL_INDEX_MAX: usize = 30;

const FL_INDEX_SHIFT: usize = SL_INDEX_COUNT_LOG2 + ALIGN_SIZE_LOG2;
const FL_INDEX_COUNT: usize = FL_INDEX_MAX - FL_INDEX_SHIFT + 1;
const SMALL_BLOCK_SIZE: usize = 1 << FL_INDEX_SHIFT;

const FREE_BIT: usize = 1;
const PREV_FREE_BIT: usize = 2;
const FLAG_BITS: usize = FREE_BIT | PREV_FREE_BIT;

/// Bytes of header carried by every used block.
pub const BLOCK_OVERHEAD: usize = size_of::<usize>();

/// Offset from a block header to its payload.
const BLOCK_START_OFFSET: usize = size_of::<*mut BlockHeader>() + size_of::<usize>();

/// Smallest block: enough payload to hold the free-list links and the
/// successor's back pointer once freed.
pub const BLOCK_SIZE_MIN: usize = size_of::<BlockHeader>() - size_of::<*mut BlockHeader>();

/// Blocks must be strictly smaller than this.
pub const BLOCK_SIZE_MAX: usize = 1 << FL_INDEX_MAX;

/// Bytes of every registered span that can never be handed out: the leading
/// back-pointer word plus the trailing sentinel header.
pub const REGION_OVERHEAD: usize = BLOCK_START_OFFSET + BLOCK_OVERHEAD;

#[repr(C)]
struct BlockHeader {
    /// Previous physical block; only meaningful while that block is free.
    prev_phys: *mut BlockHeader,
    /// Payload size with `FREE_BIT` / `PREV_FREE_BIT` folded into the low bits.
    size: usize,
    next_free: *mut BlockHeader,
    prev_free: *mut BlockHeader,
}

// -----------------------------------------------------------------------------
// Block header accessors
// -----------------------------------------------------------------------------

unsafe fn block_size(block: *mut BlockHeader) -> usize {
    (*block).size & !FLAG_BITS
}

unsafe fn set_block_size(block: *mut BlockHeader, size: usize) {
    (*block).size = size | ((*block).size & FLAG_BITS);
}

unsafe fn is_last(block: *mut BlockHeader) -> bool {
    block_size(block) == 0
}

unsafe fn is_free(block: *mut BlockHeader) -> bool {
    (*block).size & FREE_BIT != 0
}

unsafe fn set_free(block: *mut BlockHeader) {
    (*block).size |= FREE_BIT;
}

unsafe fn set_used(block: *mut BlockHeader) {
    (*block).size &= !FREE_BIT;
}

unsafe fn is_prev_free(block: *mut BlockHeader) -> bool {
    (*block).size & PREV_FREE_BIT != 0
}

unsafe fn set_prev_free(block: *mut BlockHeader) {
    (*block).size |= PREV_FREE_BIT;
}

unsafe fn set_prev_used(block: *mut BlockHeader) {
    (*block).size &= !PREV_FREE_BIT;
}

fn block_from_ptr(ptr: *mut u8) -> *mut BlockHeader {
    ptr.wrapping_sub(BLOCK_START_OFFSET).cast()
}

fn block_to_ptr(block: *mut BlockHeader) -> *mut u8 {
    block.cast::<u8>().wrapping_add(BLOCK_START_OFFSET)
}

/// Header that starts `offset` bytes past `ptr`.
fn offset_to_block(ptr: *mut u8, offset: usize) -> *mut BlockHeader {
    ptr.wrapping_add(offset).cast()
}

unsafe fn block_next(block: *mut BlockHeader) -> *mut BlockHeader {
    debug_assert!(!is_last(block));
    offset_to_block(block_to_ptr(block), block_size(block) - BLOCK_OVERHEAD)
}

/// Publish `block` as the back pointer of its successor.
unsafe fn link_next(block: *mut BlockHeader) -> *mut BlockHeader {
    let next = block_next(block);
    (*next).prev_phys = block;
    next
}

unsafe fn mark_as_free(block: *mut BlockHeader) {
    let next = link_next(block);
    set_prev_free(next);
    set_free(block);
}

unsafe fn mark_as_used(block: *mut BlockHeader) {
    let next = block_next(block);
    set_prev_used(next);
    set_used(block);
}

unsafe fn can_split(block: *mut BlockHeader, size: usize) -> bool {
    block_size(block) >= size_of::<BlockHeader>() + size
}

/// Cut `block` down to `size`, returning the free remainder (not yet listed).
unsafe fn split(block: *mut BlockHeader, size: usize) -> *mut BlockHeader {
    let remaining = offset_to_block(block_to_ptr(block), size - BLOCK_OVERHEAD);
    let remain_size = block_size(block) - (size + BLOCK_OVERHEAD);

    debug_assert!(remain_size >= BLOCK_SIZE_MIN);
    (*remaining).size = remain_size;
    set_block_size(block, size);
    mark_as_free(remaining);
    remaining
}

/// Fold `block` into its physical predecessor `prev`.
unsafe fn absorb(prev: *mut BlockHeader, block: *mut BlockHeader) -> *mut BlockHeader {
    debug_assert!(!is_last(prev));
    (*prev).size += block_size(block) + BLOCK_OVERHEAD;
    link_next(prev);
    prev
}

// -----------------------------------------------------------------------------
// Size class mapping
// -----------------------------------------------------------------------------

fn ffs(word: u32) -> usize {
    word.trailing_zeros() as usize
}

fn fls(word: usize) -> usize {
    (usize::BITS - 1 - word.leading_zeros()) as usize
}

/// Round a request to the core's granularity; 0 means "cannot be served".
fn adjust_request_size(size: usize, align: usize) -> usize {
    if size == 0 || size >= BLOCK_SIZE_MAX {
        return 0;
    }
    let aligned = align_up(size, align);
    if aligned >= BLOCK_SIZE_MAX {
        0
    } else {
        aligned.max(BLOCK_SIZE_MIN)
    }
}

/// Bucket a block of `size` bytes belongs to.
fn mapping_insert(size: usize) -> (usize, usize) {
    if size < SMALL_BLOCK_SIZE {
        (0, size / (SMALL_BLOCK_SIZE / SL_INDEX_COUNT))
    } else {
        let fl = fls(size);
        let sl = (size >> (fl - SL_INDEX_COUNT_LOG2)) ^ (1 << SL_INDEX_COUNT_LOG2);
        (fl - (FL_INDEX_SHIFT - 1), sl)
    }
}

/// First bucket whose every block is at least `size` bytes.
fn mapping_search(size: usize) -> (usize, usize) {
    let size = if size >= SMALL_BLOCK_SIZE {
        size + (1 << (fls(size) - SL_INDEX_COUNT_LOG2)) - 1
    } else {
        size
    };
    mapping_insert(size)
}

// -----------------------------------------------------------------------------
// Core
// -----------------------------------------------------------------------------

/// Identifies a span registered with [`Tlsf::register_region`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHandle {
    start: NonNull<u8>,
    bytes: usize,
    usable: usize,
}

impl RegionHandle {
    /// First byte of the registered span.
    pub fn start(&self) -> NonNull<u8> {
        self.start
    }

    /// One past the last byte of the registered span.
    pub fn end(&self) -> usize {
        self.start.as_ptr() as usize + self.bytes
    }

    /// Payload bytes available when the span holds a single free block.
    pub fn usable(&self) -> usize {
        self.usable
    }

    /// Whether `addr` falls inside `[start, end)`.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start.as_ptr() as usize && addr < self.end()
    }
}

/// A structural problem found by [`Tlsf::check`] or [`Tlsf::check_region`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreFault {
    pub reason: &'static str,
    pub address: usize,
}

impl CoreFault {
    fn at(reason: &'static str, block: *mut BlockHeader) -> Self {
        Self {
            reason,
            address: block as usize,
        }
    }
}

/// Free-list state: bitmaps plus one list head per bucket.
pub struct Tlsf {
    fl_bitmap: u32,
    sl_bitmap: [u32; FL_INDEX_COUNT],
    blocks: [[*mut BlockHeader; SL_INDEX_COUNT]; FL_INDEX_COUNT],
}

impl Tlsf {
    /// An empty core with no registered memory.
    pub const fn new() -> Self {
        Self {
            fl_bitmap: 0,
            sl_bitmap: [0; FL_INDEX_COUNT],
            blocks: [[ptr::null_mut(); SL_INDEX_COUNT]; FL_INDEX_COUNT],
        }
    }

    /// Payload of the single free block a span of `bytes` starts out as.
    pub fn usable_for(bytes: usize) -> usize {
        align_down(bytes.saturating_sub(REGION_OVERHEAD), ALIGN_SIZE)
    }

    /// Largest request a fresh span of `bytes` is guaranteed to satisfy.
    ///
    /// Searches round a request up to the next bucket boundary, so the one
    /// free block of an empty span only serves requests up to the floor of
    /// its own bucket.
    pub fn capacity_for(bytes: usize) -> usize {
        let usable = Self::usable_for(bytes);
        if usable < SMALL_BLOCK_SIZE {
            return usable;
        }
        usable & !((1 << (fls(usable) - SL_INDEX_COUNT_LOG2)) - 1)
    }

    /// Bytes the free lists are searched for when `size` bytes aligned to
    /// `align` are requested. `None` if no span could ever serve it.
    pub fn footprint(size: usize, align: usize) -> Option<usize> {
        let adjust = adjust_request_size(size, ALIGN_SIZE);
        if adjust == 0 {
            return None;
        }
        if align <= ALIGN_SIZE {
            return Some(adjust);
        }
        // Over-allocate so a leading gap big enough to be a free block fits.
        let padded = adjust
            .checked_add(align)?
            .checked_add(size_of::<BlockHeader>())?;
        match adjust_request_size(padded, align) {
            0 => None,
            bytes => Some(bytes),
        }
    }

    fn remove_free_block(&mut self, block: *mut BlockHeader, fl: usize, sl: usize) {
        // SAFETY: block is listed in bucket (fl, sl), so it and its links are live.
        unsafe {
            let prev = (*block).prev_free;
            let next = (*block).next_free;
            if !next.is_null() {
                (*next).prev_free = prev;
            }
            if !prev.is_null() {
                (*prev).next_free = next;
            }

            if self.blocks[fl][sl] == block {
                self.blocks[fl][sl] = next;
                if next.is_null() {
                    self.sl_bitmap[fl] &= !(1u32 << sl);
                    if self.sl_bitmap[fl] == 0 {
                        self.fl_bitmap &= !(1u32 << fl);
                    }
                }
            }
        }
    }

    fn insert_free_block(&mut self, block: *mut BlockHeader, fl: usize, sl: usize) {
        let current = self.blocks[fl][sl];
        // SAFETY: block is a free block inside registered memory.
        unsafe {
            (*block).next_free = current;
            (*block).prev_free = ptr::null_mut();
            if !current.is_null() {
                (*current).prev_free = block;
            }
        }
        self.blocks[fl][sl] = block;
        self.fl_bitmap |= 1u32 << fl;
        self.sl_bitmap[fl] |= 1u32 << sl;
    }

    unsafe fn block_remove(&mut self, block: *mut BlockHeader) {
        let (fl, sl) = mapping_insert(block_size(block));
        self.remove_free_block(block, fl, sl);
    }

    unsafe fn block_insert(&mut self, block: *mut BlockHeader) {
        let (fl, sl) = mapping_insert(block_size(block));
        self.insert_free_block(block, fl, sl);
    }

    fn search_suitable_block(&self, fl: usize, sl: usize) -> Option<(*mut BlockHeader, usize, usize)> {
        let mut fl = fl;
        let mut sl_map = self.sl_bitmap[fl] & (!0u32 << sl);
        if sl_map == 0 {
            let fl_map = self.fl_bitmap & (!0u32).checked_shl(fl as u32 + 1).unwrap_or(0);
            if fl_map == 0 {
                return None;
            }
            fl = ffs(fl_map);
            sl_map = self.sl_bitmap[fl];
        }
        let sl = ffs(sl_map);
        Some((self.blocks[fl][sl], fl, sl))
    }

    fn locate_free(&mut self, size: usize) -> Option<*mut BlockHeader> {
        if size == 0 {
            return None;
        }
        let (fl, sl) = mapping_search(size);
        if fl >= FL_INDEX_COUNT {
            return None;
        }
        let (block, fl, sl) = self.search_suitable_block(fl, sl)?;
        debug_assert!(unsafe { block_size(block) } >= size);
        self.remove_free_block(block, fl, sl);
        Some(block)
    }

    unsafe fn merge_prev(&mut self, block: *mut BlockHeader) -> *mut BlockHeader {
        if is_prev_free(block) {
            let prev = (*block).prev_phys;
            debug_assert!(is_free(prev), "prev block is not free though marked as such");
            self.block_remove(prev);
            absorb(prev, block)
        } else {
            block
        }
    }

    unsafe fn merge_next(&mut self, block: *mut BlockHeader) -> *mut BlockHeader {
        let next = block_next(block);
        if is_free(next) {
            debug_assert!(!is_last(next));
            self.block_remove(next);
            absorb(block, next)
        } else {
            block
        }
    }

    /// Give back the tail of a free block that is larger than needed.
    unsafe fn trim_free(&mut self, block: *mut BlockHeader, size: usize) {
        debug_assert!(is_free(block));
        if can_split(block, size) {
            let remaining = split(block, size);
            link_next(block);
            set_prev_free(remaining);
            self.block_insert(remaining);
        }
    }

    /// Give back the tail of a used block, merging it with a free successor.
    unsafe fn trim_used(&mut self, block: *mut BlockHeader, size: usize) {
        debug_assert!(!is_free(block));
        if can_split(block, size) {
            let remaining = split(block, size);
            set_prev_used(remaining);
            let remaining = self.merge_next(remaining);
            self.block_insert(remaining);
        }
    }

    /// Give back the head of a free block so the payload lands on an alignment.
    unsafe fn trim_free_leading(&mut self, block: *mut BlockHeader, size: usize) -> *mut BlockHeader {
        if can_split(block, size) {
            let remaining = split(block, size - BLOCK_OVERHEAD);
            set_prev_free(remaining);
            link_next(block);
            self.block_insert(block);
            remaining
        } else {
            block
        }
    }

    unsafe fn prepare_used(&mut self, block: *mut BlockHeader, size: usize) -> NonNull<u8> {
        self.trim_free(block, size);
        mark_as_used(block);
        NonNull::new_unchecked(block_to_ptr(block))
    }

    /// Add `bytes` of memory at `mem` as a new source of free blocks.
    ///
    /// Returns `None` if the span is misaligned, too small, or too large to
    /// be represented.
    ///
    /// # Safety
    ///
    /// The span must be readable, writable, unused by anything else, and stay
    /// valid until it is passed to [`Tlsf::unregister_region`].
    pub unsafe fn register_region(&mut self, mem: NonNull<u8>, bytes: usize) -> Option<RegionHandle> {
        let usable = Self::usable_for(bytes);
        if !is_aligned(mem.as_ptr() as usize, ALIGN_SIZE) {
            return None;
        }
        if usable < BLOCK_SIZE_MIN || usable >= BLOCK_SIZE_MAX {
            return None;
        }

        // The first header starts at `mem`; its back pointer is never read
        // because nothing precedes it.
        let block: *mut BlockHeader = mem.as_ptr().cast();
        (*block).prev_phys = ptr::null_mut();
        (*block).size = usable;
        set_free(block);
        set_prev_used(block);
        self.block_insert(block);

        // Zero-sized used sentinel stops merges at the end of the span.
        let sentinel = link_next(block);
        (*sentinel).size = 0;
        set_used(sentinel);
        set_prev_free(sentinel);

        Some(RegionHandle {
            start: mem,
            bytes,
            usable,
        })
    }

    /// Withdraw a region from the free lists.
    ///
    /// Returns `false` (and leaves everything untouched) unless the region is
    /// a single free block, i.e. nothing inside it is allocated.
    ///
    /// # Safety
    ///
    /// `handle` must have been returned by `register_region` on this core and
    /// not unregistered since.
    pub unsafe fn unregister_region(&mut self, handle: RegionHandle) -> bool {
        let block: *mut BlockHeader = handle.start.as_ptr().cast();
        if !is_free(block) || block_size(block) != handle.usable {
            return false;
        }
        let sentinel = block_next(block);
        debug_assert!(is_last(sentinel));
        if !is_last(sentinel) {
            return false;
        }
        self.block_remove(block);
        true
    }

    /// Allocate `size` bytes aligned to [`ALIGN_SIZE`].
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let adjust = adjust_request_size(size, ALIGN_SIZE);
        let block = self.locate_free(adjust)?;
        // SAFETY: block was just unlinked from a free list and is big enough.
        Some(unsafe { self.prepare_used(block, adjust) })
    }

    /// Allocate `size` bytes whose address is a multiple of `align`.
    ///
    /// `align` must be a power of two.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        if align <= ALIGN_SIZE {
            return self.allocate(size);
        }

        let adjust = adjust_request_size(size, ALIGN_SIZE);
        let size_with_gap = Self::footprint(size, align)?;
        let gap_minimum = size_of::<BlockHeader>();
        let mut block = self.locate_free(size_with_gap)?;

        // SAFETY: block is a free block of at least size_with_gap bytes.
        unsafe {
            let ptr = block_to_ptr(block);
            let mut aligned = align_ptr(ptr, align);
            let mut gap = aligned as usize - ptr as usize;

            if gap != 0 && gap < gap_minimum {
                let offset = (gap_minimum - gap).max(align);
                aligned = align_ptr(aligned.wrapping_add(offset), align);
                gap = aligned as usize - ptr as usize;
            }
            if gap != 0 {
                block = self.trim_free_leading(block, gap);
            }
            Some(self.prepare_used(block, adjust))
        }
    }

    /// Return a block to the free lists, coalescing with free neighbours.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this core.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        let block = block_from_ptr(ptr.as_ptr());
        debug_assert!(!is_free(block), "block already marked as free");
        mark_as_free(block);
        let block = self.merge_prev(block);
        let block = self.merge_next(block);
        self.block_insert(block);
    }

    /// Resize a block, in place when the block or its free successor has
    /// room, otherwise by allocate-copy-release.
    ///
    /// On failure `ptr` is left untouched and still owned by the caller.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this core.
    pub unsafe fn resize(&mut self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        let adjust = adjust_request_size(size, ALIGN_SIZE);
        if adjust == 0 {
            return None;
        }

        let block = block_from_ptr(ptr.as_ptr());
        let next = block_next(block);
        let cursize = block_size(block);
        let combined = cursize + block_size(next) + BLOCK_OVERHEAD;

        if adjust > cursize && (!is_free(next) || adjust > combined) {
            let fresh = self.allocate(size)?;
            ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), cursize.min(size));
            self.release(ptr);
            return Some(fresh);
        }

        if adjust > cursize {
            self.merge_next(block);
            mark_as_used(block);
        }
        self.trim_used(block, adjust);
        Some(ptr)
    }

    /// Usable payload size of a live allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from a core.
    pub unsafe fn block_size(ptr: NonNull<u8>) -> usize {
        block_size(block_from_ptr(ptr.as_ptr()))
    }

    /// Validate bitmaps and every free list.
    pub fn check(&self) -> Result<(), CoreFault> {
        for fl in 0..FL_INDEX_COUNT {
            for sl in 0..SL_INDEX_COUNT {
                let fl_set = self.fl_bitmap & (1u32 << fl) != 0;
                let sl_set = self.sl_bitmap[fl] & (1u32 << sl) != 0;
                let head = self.blocks[fl][sl];

                if !fl_set && sl_set {
                    return Err(CoreFault::at("second-level bit set without first-level bit", head));
                }
                if !sl_set {
                    if !head.is_null() {
                        return Err(CoreFault::at("free list non-empty but bitmap clear", head));
                    }
                    continue;
                }
                if head.is_null() {
                    return Err(CoreFault::at("bitmap set but free list empty", head));
                }
                // SAFETY: listed blocks live in registered memory; the back-link
                // check below stops the walk on the first broken link.
                unsafe { self.check_list(head, fl, sl)? };
            }
        }
        Ok(())
    }

    unsafe fn check_list(&self, head: *mut BlockHeader, fl: usize, sl: usize) -> Result<(), CoreFault> {
        if !(*head).prev_free.is_null() {
            return Err(CoreFault::at("free list head has a predecessor", head));
        }
        let mut block = head;
        while !block.is_null() {
            if !is_free(block) {
                return Err(CoreFault::at("block in free list is not marked free", block));
            }
            if is_prev_free(block) {
                return Err(CoreFault::at("free block follows a free block", block));
            }
            let size = block_size(block);
            if size < BLOCK_SIZE_MIN {
                return Err(CoreFault::at("free block below minimum size", block));
            }
            if mapping_insert(size) != (fl, sl) {
                return Err(CoreFault::at("free block listed in the wrong size class", block));
            }
            let next_phys = block_next(block);
            if is_free(next_phys) {
                return Err(CoreFault::at("free block not coalesced with its successor", block));
            }
            if !is_prev_free(next_phys) || (*next_phys).prev_phys != block {
                return Err(CoreFault::at("successor does not point back at free block", block));
            }
            let next = (*block).next_free;
            if !next.is_null() && (*next).prev_free != block {
                return Err(CoreFault::at("free list back link broken", next));
            }
            block = next;
        }
        Ok(())
    }

    /// Walk every physical block of one region, returning the payload bytes
    /// held by used blocks.
    ///
    /// # Safety
    ///
    /// `handle` must be registered with this core.
    pub unsafe fn check_region(&self, handle: RegionHandle) -> Result<usize, CoreFault> {
        let end = handle.end();
        let mut block: *mut BlockHeader = handle.start.as_ptr().cast();
        let mut prev_free = false;
        let mut used = 0;

        loop {
            if block as usize + BLOCK_START_OFFSET > end {
                return Err(CoreFault::at("block header runs past region end", block));
            }
            if is_prev_free(block) != prev_free {
                return Err(CoreFault::at("prev-free flag disagrees with previous block", block));
            }
            if prev_free && (*block).prev_phys.is_null() {
                return Err(CoreFault::at("missing back pointer after free block", block));
            }

            let size = block_size(block);
            if size == 0 {
                if is_free(block) {
                    return Err(CoreFault::at("region sentinel marked free", block));
                }
                let expected = handle.start.as_ptr() as usize + handle.usable + BLOCK_OVERHEAD;
                if block as usize != expected {
                    return Err(CoreFault::at("region sentinel misplaced", block));
                }
                return Ok(used);
            }

            if size < BLOCK_SIZE_MIN || !is_aligned(size, ALIGN_SIZE) {
                return Err(CoreFault::at("block size invalid", block));
            }
            let free = is_free(block);
            if free {
                if prev_free {
                    return Err(CoreFault::at("adjacent free blocks not coalesced", block));
                }
                if !self.is_listed(block) {
                    return Err(CoreFault::at("free block missing from its free list", block));
                }
            } else {
                used += size;
            }

            prev_free = free;
            block = block_next(block);
        }
    }

    unsafe fn is_listed(&self, block: *mut BlockHeader) -> bool {
        let (fl, sl) = mapping_insert(block_size(block));
        if fl >= FL_INDEX_COUNT {
            return false;
        }
        let mut cursor = self.blocks[fl][sl];
        while !cursor.is_null() {
            if cursor == block {
                return true;
            }
            cursor = (*cursor).next_free;
        }
        false
    }
}

impl Default for Tlsf {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocators::os;

    struct Harness {
        core: Tlsf,
        mapping: os::Mapping,
        region: RegionHandle,
    }

    impl Harness {
        fn new(bytes: usize) -> Self {
            let mapping = os::map(bytes).expect("map failed");
            let mut core = Tlsf::new();
            let region = unsafe { core.register_region(mapping.base(), mapping.len()) }
                .expect("register failed");
            Self {
                core,
                mapping,
                region,
            }
        }

        fn check(&self) {
            self.core.check().expect("free lists corrupted");
            unsafe { self.core.check_region(self.region) }.expect("region corrupted");
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            unsafe { os::unmap(self.mapping) };
        }
    }

    #[test]
    fn test_mapping_small_and_large() {
        assert_eq!(mapping_insert(0), (0, 0));
        assert_eq!(mapping_insert(SMALL_BLOCK_SIZE - 1).0, 0);
        let (fl, sl) = mapping_insert(SMALL_BLOCK_SIZE);
        assert_eq!((fl, sl), (1, 0));
        // Searching rounds up to the next bucket boundary.
        let (fl, sl) = mapping_search(SMALL_BLOCK_SIZE + 1);
        assert_eq!((fl, sl), (1, 1));
    }

    #[test]
    fn test_fresh_region_serves_exactly_its_capacity() {
        for bytes in [4096, 64 * 1024, 1024 * 1024] {
            let mut h = Harness::new(bytes);
            let bytes = h.mapping.len();
            let capacity = Tlsf::capacity_for(bytes);
            assert!(capacity <= Tlsf::usable_for(bytes));

            assert!(h.core.allocate(capacity + 1).is_none(), "{bytes}: capacity + 1 placed");
            let p = h.core.allocate(capacity).expect("capacity must be served");
            unsafe { h.core.release(p) };
            h.check();
        }
        // Bucket floor of a 1 MiB span: 1 MiB - 24 rounded down to 16 KiB steps.
        assert_eq!(Tlsf::capacity_for(1024 * 1024), 1_032_192);
    }

    #[test]
    fn test_footprint_matches_aligned_search() {
        assert_eq!(Tlsf::footprint(0, ALIGN_SIZE), None);
        assert_eq!(Tlsf::footprint(1, ALIGN_SIZE), Some(BLOCK_SIZE_MIN));
        assert_eq!(Tlsf::footprint(100, 64), Some(align_up(104 + 64 + 32, 64)));
        assert_eq!(Tlsf::footprint(100, 1 << 62), None);

        let mut h = Harness::new(64 * 1024);
        let capacity = Tlsf::capacity_for(h.mapping.len());
        let size = capacity - 1024 - size_of::<BlockHeader>();
        assert_eq!(Tlsf::footprint(size, 1024), Some(capacity));
        let p = h.core.allocate_aligned(size, 1024).expect("aligned capacity");
        assert!(is_aligned(p.as_ptr() as usize, 1024));
        unsafe { h.core.release(p) };
        h.check();
    }

    #[test]
    fn test_adjust_request_size() {
        assert_eq!(adjust_request_size(0, ALIGN_SIZE), 0);
        assert_eq!(adjust_request_size(1, ALIGN_SIZE), BLOCK_SIZE_MIN);
        assert_eq!(adjust_request_size(BLOCK_SIZE_MIN + 1, ALIGN_SIZE), align_up(BLOCK_SIZE_MIN + 1, ALIGN_SIZE));
        assert_eq!(adjust_request_size(BLOCK_SIZE_MAX, ALIGN_SIZE), 0);
    }

    #[test]
    fn test_allocate_and_release_restores_single_block() {
        let mut h = Harness::new(64 * 1024);
        let usable = h.region.usable();

        let a = h.core.allocate(100).expect("alloc a");
        let b = h.core.allocate(2000).expect("alloc b");
        assert!(is_aligned(a.as_ptr() as usize, ALIGN_SIZE));
        assert!(unsafe { Tlsf::block_size(a) } >= 100);
        h.check();

        unsafe {
            h.core.release(a);
            h.check();
            h.core.release(b);
        }
        h.check();

        // Everything coalesced back into one block covering the region.
        let block: *mut BlockHeader = h.region.start().as_ptr().cast();
        assert_eq!(unsafe { block_size(block) }, usable);
        assert!(unsafe { h.core.unregister_region(h.region) });
    }

    #[test]
    fn test_unregister_refuses_busy_region() {
        let mut h = Harness::new(16 * 1024);
        let p = h.core.allocate(64).expect("alloc");
        assert!(!unsafe { h.core.unregister_region(h.region) });
        unsafe { h.core.release(p) };
        assert!(unsafe { h.core.unregister_region(h.region) });
        assert!(h.core.allocate(64).is_none());
    }

    fn fill(core: &mut Tlsf, size: usize) -> Vec<NonNull<u8>> {
        let mut ptrs = Vec::new();
        while let Some(p) = core.allocate(size) {
            ptrs.push(p);
        }
        ptrs
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut h = Harness::new(4096);
        let ptrs = fill(&mut h.core, 64);
        assert!(!ptrs.is_empty());
        assert!(h.core.allocate(64).is_none());
        h.check();

        for p in ptrs {
            unsafe { h.core.release(p) };
        }
        h.check();
        assert!(h.core.allocate(1024).is_some());
    }

    #[test]
    fn test_resize_in_place_and_moving() {
        let mut h = Harness::new(64 * 1024);
        let p = h.core.allocate(64).expect("alloc");
        unsafe {
            ptr::write_bytes(p.as_ptr(), 0x5A, 64);

            // Successor is free: grows in place.
            let grown = h.core.resize(p, 512).expect("grow");
            assert_eq!(grown, p);
            assert!(Tlsf::block_size(grown) >= 512);
            h.check();

            // Pin the successor so the next grow has to move.
            let pin = h.core.allocate(32).expect("pin");
            let moved = h.core.resize(grown, 4096).expect("move");
            assert_ne!(moved, grown);
            let bytes = std::slice::from_raw_parts(moved.as_ptr(), 64);
            assert!(bytes.iter().all(|&b| b == 0x5A));
            h.check();

            let shrunk = h.core.resize(moved, 16).expect("shrink");
            assert_eq!(shrunk, moved);
            h.check();

            h.core.release(shrunk);
            h.core.release(pin);
        }
        h.check();
    }

    #[test]
    fn test_allocate_aligned() {
        let mut h = Harness::new(256 * 1024);
        let mut ptrs = Vec::new();
        for align in [16usize, 64, 256, 4096] {
            let p = h.core.allocate_aligned(100, align).expect("aligned alloc");
            assert!(is_aligned(p.as_ptr() as usize, align), "align {align}");
            ptrs.push(p);
            h.check();
        }
        for p in ptrs {
            unsafe { h.core.release(p) };
        }
        h.check();
    }

    #[test]
    fn test_check_detects_clobbered_header() {
        let mut h = Harness::new(16 * 1024);
        let a = h.core.allocate(64).expect("alloc a");
        let _b = h.core.allocate(64).expect("alloc b");
        unsafe {
            // Flip the free bit of an allocated block behind the core's back.
            set_free(block_from_ptr(a.as_ptr()));
            assert!(h.core.check_region(h.region).is_err());
            set_used(block_from_ptr(a.as_ptr()));
        }
        h.check();
    }

    #[test]
    fn test_two_regions_share_free_lists() {
        let mut h = Harness::new(8 * 1024);
        let first = fill(&mut h.core, 64);
        assert!(first.iter().all(|p| h.region.contains(p.as_ptr() as usize)));

        let extra = os::map(8 * 1024).expect("map");
        let second = unsafe { h.core.register_region(extra.base(), extra.len()) }.expect("register");
        let b = h.core.allocate(64).expect("served by second");
        assert!(second.contains(b.as_ptr() as usize));
        assert!(!unsafe { h.core.unregister_region(second) });

        unsafe {
            h.core.release(b);
            assert!(h.core.unregister_region(second));
            os::unmap(extra);
            for p in first {
                h.core.release(p);
            }
        }
        h.check();
    }
}
