//! Integration tests for tlsfalloc.

use std::ptr;
use std::sync::Arc;
use std::thread;

use tlsfalloc::{create_instance, destroy_instance, kb, mb, Arena, ArenaConfig, ArenaError};

/// Instance destroyed when the test ends, pass or fail.
struct Scoped(Arena);

impl Scoped {
    fn new(config: ArenaConfig) -> Self {
        Self(create_instance(&config).expect("create instance"))
    }
}

impl std::ops::Deref for Scoped {
    type Target = Arena;

    fn deref(&self) -> &Arena {
        &self.0
    }
}

impl Drop for Scoped {
    fn drop(&mut self) {
        unsafe {
            let _ = destroy_instance(self.0);
        }
    }
}

fn assert_counters_agree(arena: &Arena) {
    let stats = arena.stats();
    let regions = arena.region_dump();
    assert_eq!(stats.region_count, regions.len());
    assert_eq!(stats.total_used, regions.iter().map(|r| r.used).sum::<usize>());
    assert_eq!(stats.total_capacity, regions.iter().map(|r| r.capacity).sum::<usize>());
}

#[test]
fn test_growth_adds_one_region_for_ten_blocks() {
    let arena = Scoped::new(ArenaConfig::minimal());
    assert_eq!(arena.region_count(), 1);

    let mut blocks = Vec::new();
    for i in 0..10 {
        let p = arena.allocate(kb(200));
        assert!(!p.is_null(), "allocation {i} failed");
        blocks.push(p);
        let expected = if i < 5 { 1 } else { 2 };
        assert_eq!(arena.region_count(), expected, "after allocation {i}");
    }

    // The initial region plus exactly one grown region.
    let stats = arena.stats();
    assert_eq!(stats.regions_mapped, 2);
    assert_eq!(stats.allocation_count, 10);
    assert_counters_agree(&arena);

    let regions = arena.region_dump();
    for &p in &blocks {
        let owner = arena.resolve(p).expect("resolvable");
        let holding: Vec<_> = regions.iter().filter(|r| r.contains(p as usize)).collect();
        assert_eq!(holding.len(), 1);
        assert_eq!(holding[0].id, owner.id);
    }

    for p in blocks {
        unsafe { arena.release(p) };
    }
    assert_eq!(arena.stats().total_used, 0);
    assert_eq!(arena.region_count(), 1);
    assert!(arena.integrity_check().is_ok());
}

#[test]
fn test_request_larger_than_region_fails_fast() {
    let arena = Scoped::new(ArenaConfig::default().with_region_size(mb(8)));

    let err = arena.try_allocate(mb(10)).unwrap_err();
    assert!(matches!(err, ArenaError::TooLarge { requested, .. } if requested == mb(10)));
    assert_eq!(arena.region_count(), 1);

    // More regions do not change the answer.
    let filler: Vec<_> = (0..3).map(|_| arena.allocate(mb(6))).collect();
    assert!(filler.iter().all(|p| !p.is_null()));
    assert!(arena.region_count() >= 3);
    assert!(arena.allocate(mb(10)).is_null());

    let stats = arena.stats();
    assert_eq!(stats.failed_count, 2);
    for p in filler {
        unsafe { arena.release(p) };
    }
}

#[test]
fn test_requests_at_region_capacity() {
    let arena = Scoped::new(ArenaConfig::minimal());
    let capacity = arena.region_capacity();

    for size in [capacity, capacity - 1, capacity - kb(8)] {
        let p = arena.try_allocate(size).expect("fits one region");
        assert_eq!(arena.region_count(), 1, "size {size}");
        unsafe { arena.release(p.as_ptr()) };
    }

    for _ in 0..5 {
        let err = arena.try_allocate(capacity + 1).unwrap_err();
        assert!(matches!(err, ArenaError::TooLarge { limit, .. } if limit == capacity));
    }
    assert_eq!(arena.region_count(), 1);
    assert_eq!(arena.stats().total_used, 0);

    // A partly used arena grows once and serves the full capacity from the new region.
    let small = arena.allocate(kb(64));
    let big = arena.try_allocate(capacity).expect("served by a grown region");
    assert_eq!(arena.region_count(), 2);
    unsafe {
        arena.release(big.as_ptr());
        arena.release(small);
    }
    assert_eq!(arena.region_count(), 1);
    assert!(arena.integrity_check().is_ok());
}

#[test]
fn test_emptied_region_is_unmapped() {
    let arena = Scoped::new(ArenaConfig::minimal());
    let first_id = arena.region_dump()[0].id;

    let blocks: Vec<_> = (0..6).map(|_| arena.allocate(kb(200))).collect();
    assert_eq!(arena.region_count(), 2);
    let second = arena.region_dump()[1];

    let in_second: Vec<_> = blocks.iter().copied().filter(|&p| second.contains(p as usize)).collect();
    assert!(!in_second.is_empty());
    for &p in &in_second {
        unsafe { arena.release(p) };
    }

    let regions = arena.region_dump();
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].id, first_id);
    assert_eq!(arena.stats().regions_released, 1);

    let small = arena.allocate(kb(1));
    assert_eq!(arena.resolve(small).map(|r| r.id), Some(first_id));

    unsafe {
        arena.release(small);
        for p in blocks.into_iter().filter(|p| !in_second.contains(p)) {
            arena.release(p);
        }
    }
    assert_counters_agree(&arena);
}

#[test]
fn test_sole_region_is_never_unmapped() {
    let arena = Scoped::new(ArenaConfig::minimal());
    let id = arena.region_dump()[0].id;
    for _ in 0..3 {
        let p = arena.allocate(kb(4));
        unsafe { arena.release(p) };
        assert_eq!(arena.region_count(), 1);
        assert_eq!(arena.region_dump()[0].id, id);
    }
    assert_eq!(arena.stats().regions_released, 0);
}

#[test]
fn test_resize_moves_across_regions() {
    let arena = Scoped::new(ArenaConfig::minimal());

    // Five blocks fill the first region, the sixth opens a second one.
    let blocks: Vec<_> = (0..6).map(|_| arena.allocate(kb(200))).collect();
    assert_eq!(arena.region_count(), 2);
    let first = blocks[0];
    for (i, byte) in (0..kb(200)).map(|i| (i % 251) as u8).enumerate() {
        unsafe { *first.add(i) = byte };
    }

    let before = arena.region_dump();
    let old_size = unsafe { arena.usable_size(first) }.unwrap();

    let moved = unsafe { arena.resize(first, kb(400)) };
    assert!(!moved.is_null());
    assert_ne!(moved, first);

    let after = arena.region_dump();
    let old_region = before.iter().find(|r| r.contains(first as usize)).unwrap();
    let new_region = after.iter().find(|r| r.contains(moved as usize)).unwrap();
    let new_size = unsafe { arena.usable_size(moved) }.unwrap();
    assert!(new_size >= kb(400));

    let old_after = after.iter().find(|r| r.id == old_region.id).unwrap();
    let new_before = before.iter().find(|r| r.id == new_region.id).unwrap();
    assert_eq!(old_after.used, old_region.used - old_size);
    assert_eq!(new_region.used, new_before.used + new_size);

    for i in 0..kb(200) {
        assert_eq!(unsafe { *moved.add(i) }, (i % 251) as u8);
    }
    assert_eq!(arena.stats().resize_count, 1);
    assert_counters_agree(&arena);

    unsafe {
        arena.release(moved);
        for &p in &blocks[1..] {
            arena.release(p);
        }
    }
    assert!(arena.integrity_check().is_ok());
}

#[test]
fn test_failed_resize_leaves_block_intact() {
    let arena = Scoped::new(ArenaConfig::minimal());
    let p = arena.allocate(64);
    unsafe {
        ptr::write_bytes(p, 0x5A, 64);
        let err = arena.try_resize(ptr::NonNull::new(p).unwrap(), mb(2)).unwrap_err();
        assert!(matches!(err, ArenaError::TooLarge { .. }));
        assert!(std::slice::from_raw_parts(p, 64).iter().all(|&b| b == 0x5A));
        arena.release(p);
    }
}

#[test]
fn test_zero_sized_requests() {
    let arena = Scoped::new(ArenaConfig::minimal());
    let a = arena.allocate(0);
    let b = arena.allocate(0);
    assert!(!a.is_null() && !b.is_null());
    assert_ne!(a, b);

    unsafe {
        let p = arena.allocate(512);
        let shrunk = arena.resize(p, 0);
        assert!(!shrunk.is_null());
        assert!(arena.owns(shrunk));
        arena.release(shrunk);
        arena.release(a);
        arena.release(b);
    }
    assert_eq!(arena.stats().total_used, 0);
}

#[test]
fn test_integrity_after_mixed_workload() {
    let arena = Scoped::new(ArenaConfig::minimal());
    let mut live = Vec::new();
    for i in 0..200usize {
        let size = 16 + (i * 97) % 8000;
        live.push(arena.allocate(size));
        if i % 3 == 0 {
            let p = live.swap_remove(i % live.len());
            unsafe { arena.release(p) };
        }
        if i % 7 == 0 && !live.is_empty() {
            let idx = i % live.len();
            live[idx] = unsafe { arena.resize(live[idx], size * 2) };
        }
    }
    assert!(live.iter().all(|p| !p.is_null()));
    assert!(arena.integrity_check().is_ok());
    assert_counters_agree(&arena);

    for p in live {
        unsafe { arena.release(p) };
    }
    assert_eq!(arena.stats().active_allocations(), 0);
    assert!(arena.integrity_check().is_ok());
}

#[test]
fn test_shared_arena_across_threads() {
    let arena = Arc::new(Scoped::new(ArenaConfig::minimal()));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let arena = Arc::clone(&arena);
            thread::spawn(move || {
                for round in 0..50 {
                    let size = 32 + (t * 1000 + round * 37) % 20_000;
                    let p = arena.allocate(size);
                    assert!(!p.is_null());
                    unsafe {
                        ptr::write_bytes(p, t as u8, size);
                        assert_eq!(*p.add(size - 1), t as u8);
                        arena.release(p);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let stats = arena.stats();
    assert_eq!(stats.allocation_count, 200);
    assert_eq!(stats.release_count, 200);
    assert_eq!(stats.total_used, 0);
    assert!(arena.integrity_check().is_ok());
}

#[test]
fn test_independent_arenas_per_thread() {
    let handles: Vec<_> = (0..4)
        .map(|_| {
            thread::spawn(|| {
                let arena = Scoped::new(ArenaConfig::minimal());
                tlsfalloc::set_active(*arena).unwrap();
                let fns = tlsfalloc::memory_functions();
                unsafe {
                    let p = (fns.malloc)(kb(300));
                    assert!(arena.owns(p.cast()));
                    (fns.free)(p);
                }
                tlsfalloc::rebase_to_base();
                arena.stats().release_count
            })
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), 1);
    }
}

#[test]
fn test_boxed_values() {
    let arena = Scoped::new(ArenaConfig::minimal());
    {
        let mut numbers = arena.boxed([1u32; 64]).unwrap();
        numbers[10] = 99;
        assert_eq!(numbers.iter().sum::<u32>(), 63 + 99);
        assert_eq!(arena.stats().active_allocations(), 1);
    }
    assert_eq!(arena.stats().active_allocations(), 0);
}

#[test]
fn test_stats_display() {
    let arena = Scoped::new(ArenaConfig::minimal());
    let text = arena.stats().to_string();
    assert!(text.contains(&format!("Arena {} Statistics", arena.id())), "{text}");
    let row = arena.region_dump()[0].to_string();
    assert!(!row.is_empty());
}
