//! Instance state: one allocation core plus the regions that feed it.
//!
//! The whole control block (core free lists, region table, counters, lock)
//! is written into memory mapped straight from the OS, so creating, growing
//! and shrinking an instance never goes through a heap. For the base instance
//! the first region shares that mapping and is pinned.
//!
//! Every public operation takes the instance lock for its full duration and
//! collects events and diagnostics in an [`EventBuffer`], which is flushed
//! after the lock is released.

use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};

use crate::allocators::os::{self, Mapping};
use crate::allocators::region::{Region, RegionTable};
use crate::allocators::tlsf::{Tlsf, ALIGN_SIZE};
use crate::api::config::ArenaConfig;
use crate::api::error::{ArenaError, Corruption, Integrity};
use crate::api::stats::{ArenaStats, RegionSummary};
use crate::core::directory::NEXT_REGION_ID;
use crate::debug::poison;
use crate::diagnostics::events::{ArenaEvent, EventBuffer};
use crate::diagnostics::kind::{TA001, TA002, TA003, TA004, TA201, TA202, TA901};
use crate::sync::mutex::Mutex;
use crate::util::layout::align_up;

/// Fixed per-instance parameters derived from the config at creation.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    instance: u64,
    /// Page-aligned bytes mapped per grown region.
    region_bytes: usize,
    /// Largest request an empty grown region is guaranteed to serve.
    region_capacity: usize,
    max_regions: usize,
    poison: bool,
}

/// Instance control block. Lives at the start of its own mapping.
pub(crate) struct InstanceBlock {
    geometry: Geometry,
    config: ArenaConfig,
    control: Mapping,
    state: Mutex<InstanceState>,
}

// SAFETY: all mutable state sits behind `state`; the rest is immutable after
// creation.
unsafe impl Send for InstanceBlock {}
unsafe impl Sync for InstanceBlock {}

struct InstanceState {
    core: Tlsf,
    regions: RegionTable,
    total_capacity: usize,
    total_used: usize,
    peak_used: usize,
    allocations: u64,
    releases: u64,
    resizes: u64,
    failed: u64,
    regions_mapped: u64,
    regions_released: u64,
}

// SAFETY: the raw pointers inside point into mappings owned by this instance
// and are only touched under the instance lock.
unsafe impl Send for InstanceState {}

impl InstanceBlock {
    /// Map a control block, write a fresh instance into it, and map the
    /// initial regions. With `embed_first` the first region is carved from
    /// the control mapping and pinned.
    pub(crate) fn create(
        config: &ArenaConfig,
        id: u64,
        embed_first: bool,
    ) -> Result<NonNull<InstanceBlock>, ArenaError> {
        config.validate()?;
        let region_bytes = os::page_align(config.region_size)
            .ok_or(ArenaError::InvalidConfig("region_size exceeds the largest block"))?;
        let geometry = Geometry {
            instance: id,
            region_bytes,
            region_capacity: Tlsf::capacity_for(region_bytes),
            max_regions: config.max_regions,
            poison: config.poison_on_release,
        };

        let header = align_up(size_of::<InstanceBlock>(), align_of::<InstanceBlock>().max(ALIGN_SIZE));
        let control_bytes = if embed_first {
            header
                .checked_add(region_bytes)
                .ok_or(ArenaError::InvalidConfig("region_size exceeds the largest block"))?
        } else {
            header
        };
        let control = os::map(control_bytes).ok_or(ArenaError::MapFailed {
            bytes: control_bytes,
        })?;

        let block = control.base().cast::<InstanceBlock>();
        // SAFETY: the mapping is fresh, page aligned, and at least `header`
        // bytes long.
        unsafe {
            ptr::write(
                block.as_ptr(),
                InstanceBlock {
                    geometry,
                    config: *config,
                    control,
                    state: Mutex::new(InstanceState::new()),
                },
            );
        }

        // SAFETY: just initialized above.
        let instance = unsafe { block.as_ref() };
        let populated = {
            let mut state = instance.state.lock();
            let embedded = if embed_first {
                // SAFETY: `header` < control length, so the span is inside the mapping.
                let mem = unsafe { NonNull::new_unchecked(control.base().as_ptr().add(header)) };
                Some((mem, control.len() - header))
            } else {
                None
            };
            state.populate(&geometry, embedded, config.initial_regions())
        };

        if let Err(err) = populated {
            // SAFETY: nothing has been handed out from this instance.
            unsafe { Self::destroy(block) };
            return Err(err);
        }
        Ok(block)
    }

    /// Unmap every region and then the control block itself.
    ///
    /// # Safety
    ///
    /// `block` must come from [`InstanceBlock::create`], not be destroyed
    /// already, and no pointer into the instance may be used afterwards.
    pub(crate) unsafe fn destroy(block: NonNull<InstanceBlock>) {
        let control = block.as_ref().control;
        {
            let mut state = block.as_ref().state.lock();
            while let Some(region) = state.regions.pop() {
                region.discard();
            }
        }
        ptr::drop_in_place(block.as_ptr());
        os::unmap(control);
    }

    pub(crate) fn id(&self) -> u64 {
        self.geometry.instance
    }

    pub(crate) fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Largest request any region of this instance can hold.
    pub(crate) fn region_capacity(&self) -> usize {
        self.geometry.region_capacity
    }

    /// Regions currently held.
    pub(crate) fn region_count(&self) -> usize {
        self.state.lock().regions.len()
    }

    pub(crate) fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, ArenaError> {
        let mut events = EventBuffer::new();
        let result = self.state.lock().allocate(&self.geometry, size, align, &mut events);
        events.flush();
        result
    }

    /// # Safety
    ///
    /// `ptr` must be a live allocation from this instance.
    pub(crate) unsafe fn release(&self, ptr: NonNull<u8>) -> Result<(), ArenaError> {
        let mut events = EventBuffer::new();
        let result = self.state.lock().release(&self.geometry, ptr, &mut events);
        events.flush();
        result
    }

    /// # Safety
    ///
    /// `ptr` must be a live allocation from this instance.
    pub(crate) unsafe fn resize(&self, ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>, ArenaError> {
        let mut events = EventBuffer::new();
        let result = self.state.lock().resize(&self.geometry, ptr, size, &mut events);
        events.flush();
        result
    }

    /// Usable size of a block, if `ptr` lies in one of this instance's regions.
    ///
    /// # Safety
    ///
    /// If owned, `ptr` must be a live allocation.
    pub(crate) unsafe fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let state = self.state.lock();
        state.regions.find(ptr.as_ptr() as usize)?;
        Some(Tlsf::block_size(ptr))
    }

    /// Region owning `addr`, scanning head to tail.
    pub(crate) fn resolve(&self, addr: usize) -> Option<RegionSummary> {
        let state = self.state.lock();
        let index = state.regions.find(addr)?;
        state.regions.get(index).map(summarize)
    }

    pub(crate) fn integrity_check(&self) -> Integrity {
        let integrity = self.state.lock().check();
        if let Integrity::Corrupted(corruption) = integrity {
            crate::ta_emit!(
                TA201,
                "instance {}: {}",
                self.geometry.instance,
                corruption
            );
        }
        integrity
    }

    pub(crate) fn stats(&self) -> ArenaStats {
        self.state.lock().stats(self.geometry.instance)
    }

    /// Copy the region table under the lock; build the rows after releasing it.
    pub(crate) fn region_dump(&self) -> Vec<RegionSummary> {
        let snapshot = self.state.lock().regions.clone();
        snapshot.iter().map(summarize).collect()
    }
}

fn summarize(region: &Region) -> RegionSummary {
    RegionSummary {
        id: region.id(),
        start: region.start(),
        end: region.end(),
        capacity: region.capacity(),
        used: region.used(),
        pinned: region.is_pinned(),
    }
}

/// Regions mapped while serving one request.
struct Growth {
    mapped: [usize; 2],
    count: usize,
    /// The OS or the region limit said no; do not ask again.
    refused: bool,
}

impl Growth {
    const fn new() -> Self {
        Self {
            mapped: [0; 2],
            count: 0,
            refused: false,
        }
    }

    fn record(&mut self, start: usize) {
        if let Some(slot) = self.mapped.get_mut(self.count) {
            *slot = start;
            self.count += 1;
        }
    }

    fn mapped(&self) -> &[usize] {
        &self.mapped[..self.count]
    }
}

impl InstanceState {
    const fn new() -> Self {
        Self {
            core: Tlsf::new(),
            regions: RegionTable::new(),
            total_capacity: 0,
            total_used: 0,
            peak_used: 0,
            allocations: 0,
            releases: 0,
            resizes: 0,
            failed: 0,
            regions_mapped: 0,
            regions_released: 0,
        }
    }

    fn populate(
        &mut self,
        geo: &Geometry,
        embedded: Option<(NonNull<u8>, usize)>,
        wanted: usize,
    ) -> Result<(), ArenaError> {
        if let Some((mem, bytes)) = embedded {
            // SAFETY: the span is the tail of the control mapping, which
            // outlives the core.
            let region = unsafe { Region::embedded(&mut self.core, NEXT_REGION_ID.next(), mem, bytes) }?;
            self.adopt(geo, region)?;
        }
        while self.regions.len() < wanted {
            self.add_region(geo)?;
        }
        Ok(())
    }

    fn headroom(&self) -> usize {
        self.total_capacity.saturating_sub(self.total_used)
    }

    fn adopt(&mut self, geo: &Geometry, region: Region) -> Result<Region, ArenaError> {
        if let Err(region) = self.regions.push(region) {
            // SAFETY: registered with this core a moment ago and still empty.
            unsafe { region.unmap(&mut self.core) };
            return Err(ArenaError::RegionTableFull {
                limit: geo.max_regions,
            });
        }
        self.total_capacity += region.capacity();
        self.regions_mapped += 1;
        Ok(region)
    }

    fn add_region(&mut self, geo: &Geometry) -> Result<Region, ArenaError> {
        if self.regions.len() >= geo.max_regions {
            return Err(ArenaError::RegionTableFull {
                limit: geo.max_regions,
            });
        }
        let region = Region::map(&mut self.core, NEXT_REGION_ID.next(), geo.region_bytes)?;
        self.adopt(geo, region)
    }

    /// Map one more region for the request tracked by `growth`.
    ///
    /// After the first refusal no further mapping is attempted for the same
    /// request.
    fn grow(&mut self, geo: &Geometry, growth: &mut Growth, events: &mut EventBuffer) {
        if growth.refused {
            return;
        }
        match self.add_region(geo) {
            Ok(region) => {
                growth.record(region.start());
                events.push(ArenaEvent::RegionMapped {
                    instance: geo.instance,
                    region: region.id(),
                    bytes: geo.region_bytes,
                });
            }
            Err(err) => {
                growth.refused = true;
                match err {
                    ArenaError::MapFailed { bytes } => events.diagnose(&TA002, geo.instance, bytes),
                    ArenaError::RegionTableFull { .. } => events.diagnose(&TA004, geo.instance, 0),
                    _ => {}
                }
            }
        }
    }

    /// Unmap the regions a failed request mapped.
    fn roll_back(&mut self, geo: &Geometry, growth: &Growth, events: &mut EventBuffer) {
        for &start in growth.mapped().iter().rev() {
            if let Some(index) = self.regions.find(start) {
                self.shrink(geo, index, events);
            }
        }
    }

    fn exhausted(&mut self, geo: &Geometry, requested: usize, events: &mut EventBuffer) -> ArenaError {
        self.failed += 1;
        events.push(ArenaEvent::Exhausted {
            instance: geo.instance,
            requested,
        });
        events.diagnose(&TA003, geo.instance, requested);
        ArenaError::OutOfMemory { requested }
    }

    fn too_large(&mut self, geo: &Geometry, requested: usize, events: &mut EventBuffer) -> ArenaError {
        self.failed += 1;
        events.diagnose(&TA001, geo.instance, requested);
        ArenaError::TooLarge {
            requested,
            limit: geo.region_capacity,
        }
    }

    fn place(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if align > ALIGN_SIZE {
            self.core.allocate_aligned(size, align)
        } else {
            self.core.allocate(size)
        }
    }

    /// Attribute a freshly placed block to its region and the totals.
    fn charge(&mut self, geo: &Geometry, ptr: NonNull<u8>, events: &mut EventBuffer) {
        // SAFETY: ptr was just returned by the core.
        let size = unsafe { Tlsf::block_size(ptr) };
        let index = self.regions.find(ptr.as_ptr() as usize);
        match index.and_then(|i| self.regions.get_mut(i)) {
            Some(region) => region.charge(size),
            None => events.diagnose(&TA901, geo.instance, size),
        }
        self.total_used += size;
        self.peak_used = self.peak_used.max(self.total_used);
    }

    fn allocate(
        &mut self,
        geo: &Geometry,
        size: usize,
        align: usize,
        events: &mut EventBuffer,
    ) -> Result<NonNull<u8>, ArenaError> {
        let size = size.max(1);
        let needed = match Tlsf::footprint(size, align) {
            Some(bytes) if bytes <= geo.region_capacity => bytes,
            _ => return Err(self.too_large(geo, size, events)),
        };

        let mut growth = Growth::new();
        if self.headroom() < needed {
            self.grow(geo, &mut growth, events);
        }

        let ptr = match self.place(size, align) {
            Some(ptr) => ptr,
            None => {
                self.grow(geo, &mut growth, events);
                match self.place(size, align) {
                    Some(ptr) => ptr,
                    None => {
                        self.roll_back(geo, &growth, events);
                        return Err(self.exhausted(geo, size, events));
                    }
                }
            }
        };

        self.charge(geo, ptr, events);
        self.allocations += 1;
        Ok(ptr)
    }

    fn release(&mut self, geo: &Geometry, ptr: NonNull<u8>, events: &mut EventBuffer) -> Result<(), ArenaError> {
        let Some(index) = self.regions.find(ptr.as_ptr() as usize) else {
            events.diagnose(&TA202, geo.instance, 0);
            return Err(ArenaError::ForeignPointer);
        };

        // SAFETY: the caller guarantees ptr is a live block of this instance.
        unsafe {
            let size = Tlsf::block_size(ptr);
            if geo.poison {
                poison::poison_freed(ptr.as_ptr(), size);
            }
            self.core.release(ptr);

            if let Some(region) = self.regions.get_mut(index) {
                region.credit(size);
            }
            self.total_used = self.total_used.saturating_sub(size);
        }
        self.releases += 1;
        self.shrink(geo, index, events);
        Ok(())
    }

    fn resize(
        &mut self,
        geo: &Geometry,
        ptr: NonNull<u8>,
        size: usize,
        events: &mut EventBuffer,
    ) -> Result<NonNull<u8>, ArenaError> {
        let addr = ptr.as_ptr() as usize;
        if self.regions.find(addr).is_none() {
            events.diagnose(&TA202, geo.instance, 0);
            return Err(ArenaError::ForeignPointer);
        }
        let size = size.max(1);
        let needed = match Tlsf::footprint(size, ALIGN_SIZE) {
            Some(bytes) if bytes <= geo.region_capacity => bytes,
            _ => return Err(self.too_large(geo, size, events)),
        };

        // SAFETY: the caller guarantees ptr is a live block of this instance.
        let old_size = unsafe { Tlsf::block_size(ptr) };
        let mut growth = Growth::new();
        if needed > old_size && self.headroom() < needed {
            self.grow(geo, &mut growth, events);
        }

        // SAFETY: as above; on failure the core leaves ptr untouched.
        let fresh = match unsafe { self.core.resize(ptr, size) } {
            Some(fresh) => fresh,
            None => {
                self.grow(geo, &mut growth, events);
                match unsafe { self.core.resize(ptr, size) } {
                    Some(fresh) => fresh,
                    None => {
                        self.roll_back(geo, &growth, events);
                        return Err(self.exhausted(geo, size, events));
                    }
                }
            }
        };

        // Growth only appends, so the old region's index is still valid.
        let old_index = self.regions.find(addr);
        if let Some(region) = old_index.and_then(|i| self.regions.get_mut(i)) {
            region.credit(old_size);
        }
        self.total_used = self.total_used.saturating_sub(old_size);
        self.charge(geo, fresh, events);
        self.resizes += 1;

        if fresh != ptr {
            if let Some(index) = old_index {
                self.shrink(geo, index, events);
            }
        }
        Ok(fresh)
    }

    /// Unmap the region at `index` if it is empty, unpinned, and not the
    /// instance's only region.
    fn shrink(&mut self, geo: &Geometry, index: usize, events: &mut EventBuffer) {
        let Some(region) = self.regions.get(index).copied() else {
            return;
        };
        if region.used() != 0 || region.is_pinned() || self.regions.len() <= 1 {
            return;
        }
        // SAFETY: registered with this core; unmap refuses if anything is live.
        if !unsafe { region.unmap(&mut self.core) } {
            return;
        }
        self.regions.remove(index);
        self.total_capacity -= region.capacity();
        self.regions_released += 1;
        events.push(ArenaEvent::RegionReleased {
            instance: geo.instance,
            region: region.id(),
            bytes: geo.region_bytes,
        });
    }

    fn check(&self) -> Integrity {
        if let Err(fault) = self.core.check() {
            return Integrity::Corrupted(Corruption {
                region: None,
                reason: fault.reason,
                address: fault.address,
            });
        }

        let mut used = 0;
        let mut capacity = 0;
        for region in self.regions.iter() {
            // SAFETY: every region in the table is registered with this core.
            match unsafe { self.core.check_region(region.handle()) } {
                Ok(walked) if walked == region.used() => {}
                Ok(_) => {
                    return Integrity::Corrupted(Corruption {
                        region: Some(region.id()),
                        reason: "region usage disagrees with its blocks",
                        address: region.start(),
                    })
                }
                Err(fault) => {
                    return Integrity::Corrupted(Corruption {
                        region: Some(region.id()),
                        reason: fault.reason,
                        address: fault.address,
                    })
                }
            }
            used += region.used();
            capacity += region.capacity();
        }

        if used != self.total_used {
            return Integrity::Corrupted(Corruption {
                region: None,
                reason: "instance usage disagrees with region usage",
                address: 0,
            });
        }
        if capacity != self.total_capacity {
            return Integrity::Corrupted(Corruption {
                region: None,
                reason: "instance capacity disagrees with region capacity",
                address: 0,
            });
        }
        Integrity::Ok
    }

    fn stats(&self, instance: u64) -> ArenaStats {
        ArenaStats {
            instance,
            total_capacity: self.total_capacity,
            total_used: self.total_used,
            peak_used: self.peak_used,
            region_count: self.regions.len(),
            allocation_count: self.allocations,
            release_count: self.releases,
            resize_count: self.resizes,
            failed_count: self.failed,
            regions_mapped: self.regions_mapped,
            regions_released: self.regions_released,
        }
    }
}
