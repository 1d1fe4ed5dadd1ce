//! Regions: OS-backed spans registered with an allocation core.
//!
//! A region owns its mapping unless it is embedded in the instance control
//! mapping, in which case it is pinned for the lifetime of the instance.
//! Regions are kept in an ordered, fixed-capacity table so that nothing about
//! region bookkeeping ever needs a heap.

use std::ptr::NonNull;

use super::os::{self, Mapping};
use super::tlsf::{RegionHandle, Tlsf};
use crate::api::error::ArenaError;

/// Hard cap on regions per instance; the table lives inline in mapped memory.
pub const MAX_REGIONS: usize = 256;

/// One registered span plus its usage counter.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Region {
    id: u64,
    handle: RegionHandle,
    /// `None` for the region embedded in the instance control mapping.
    mapping: Option<Mapping>,
    used: usize,
}

impl Region {
    /// Map `bytes` from the OS and register them with `core`.
    pub(crate) fn map(core: &mut Tlsf, id: u64, bytes: usize) -> Result<Self, ArenaError> {
        let mapping = os::map(bytes).ok_or(ArenaError::MapFailed { bytes })?;
        // SAFETY: the mapping is fresh, exclusively ours, and outlives the
        // registration (unregistered in `unmap` before it is returned).
        match unsafe { core.register_region(mapping.base(), mapping.len()) } {
            Some(handle) => Ok(Self {
                id,
                handle,
                mapping: Some(mapping),
                used: 0,
            }),
            None => {
                // SAFETY: never registered, nothing points into it.
                unsafe { os::unmap(mapping) };
                Err(ArenaError::InvalidConfig("region size cannot hold a block"))
            }
        }
    }

    /// Register a span carved out of another mapping. The region is pinned.
    ///
    /// # Safety
    ///
    /// The span must be writable, unused, and live as long as `core`.
    pub(crate) unsafe fn embedded(core: &mut Tlsf, id: u64, mem: NonNull<u8>, bytes: usize) -> Result<Self, ArenaError> {
        let handle = core
            .register_region(mem, bytes)
            .ok_or(ArenaError::InvalidConfig("region size cannot hold a block"))?;
        Ok(Self {
            id,
            handle,
            mapping: None,
            used: 0,
        })
    }

    /// Withdraw the region from `core` and give its span back to the OS.
    ///
    /// Returns `false` without touching anything if the region still holds
    /// allocations or is pinned.
    ///
    /// # Safety
    ///
    /// The region must be registered with `core`.
    pub(crate) unsafe fn unmap(self, core: &mut Tlsf) -> bool {
        let Some(mapping) = self.mapping else {
            return false;
        };
        if self.used != 0 || !core.unregister_region(self.handle) {
            return false;
        }
        os::unmap(mapping);
        true
    }

    /// Give the span back without consulting the core. Used on teardown,
    /// when the core itself is about to disappear.
    ///
    /// # Safety
    ///
    /// No pointer into the region may be used afterwards.
    pub(crate) unsafe fn discard(self) {
        if let Some(mapping) = self.mapping {
            os::unmap(mapping);
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn handle(&self) -> RegionHandle {
        self.handle
    }

    pub(crate) fn start(&self) -> usize {
        self.handle.start().as_ptr() as usize
    }

    pub(crate) fn end(&self) -> usize {
        self.handle.end()
    }

    /// Largest payload the region can hold when empty.
    pub(crate) fn capacity(&self) -> usize {
        self.handle.usable()
    }

    pub(crate) fn used(&self) -> usize {
        self.used
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.mapping.is_none()
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.handle.contains(addr)
    }

    pub(crate) fn charge(&mut self, bytes: usize) {
        self.used += bytes;
    }

    pub(crate) fn credit(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.used, "region usage underflow");
        self.used = self.used.saturating_sub(bytes);
    }
}

/// Ordered collection of regions, oldest first.
///
/// Removal shifts later entries down, so positions are only stable until the
/// next removal; callers look regions up by address each time.
#[derive(Clone)]
pub(crate) struct RegionTable {
    slots: [Option<Region>; MAX_REGIONS],
    len: usize,
}

impl RegionTable {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [None; MAX_REGIONS],
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len == MAX_REGIONS
    }

    /// Append at the tail. Gives the region back if the table is full.
    pub(crate) fn push(&mut self, region: Region) -> Result<(), Region> {
        if self.is_full() {
            return Err(region);
        }
        self.slots[self.len] = Some(region);
        self.len += 1;
        Ok(())
    }

    /// Remove the entry at `index`, keeping the rest in order.
    pub(crate) fn remove(&mut self, index: usize) -> Option<Region> {
        if index >= self.len {
            return None;
        }
        let region = self.slots[index].take();
        self.slots[index..self.len].rotate_left(1);
        self.len -= 1;
        region
    }

    /// Detach every region, newest first.
    pub(crate) fn pop(&mut self) -> Option<Region> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        self.slots[self.len].take()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Region> {
        self.slots[..self.len].get(index)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Region> {
        self.slots[..self.len].get_mut(index)?.as_mut()
    }

    /// Index of the first region, head to tail, whose range holds `addr`.
    pub(crate) fn find(&self, addr: usize) -> Option<usize> {
        self.iter().position(|region| region.contains(addr))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Region> {
        self.slots[..self.len].iter().flatten()
    }
}

impl Default for RegionTable {
    fn default() -> Self {
        Self::new()
    }
}
