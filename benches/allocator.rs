//! Benchmarks for tlsfalloc.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::alloc::{alloc, dealloc, Layout};
use tlsfalloc::{create_instance, destroy_instance, kb, ArenaConfig};

// =============================================================================
// SINGLE ALLOCATION (allocate + release, various sizes)
// =============================================================================

fn bench_single_alloc(c: &mut Criterion) {
    let arena = create_instance(&ArenaConfig::default()).unwrap();
    let mut group = c.benchmark_group("single_alloc");

    for size in [16usize, 64, 256, 4096, kb(64)] {
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("tlsfalloc", size), &size, |b, &size| {
            b.iter(|| unsafe {
                let p = arena.allocate(black_box(size));
                arena.release(black_box(p));
            });
        });

        group.bench_with_input(BenchmarkId::new("system_malloc", size), &size, |b, &size| {
            let layout = Layout::from_size_align(size, 8).unwrap();
            b.iter(|| unsafe {
                let p = alloc(layout);
                dealloc(black_box(p), layout);
            });
        });
    }

    group.finish();
    unsafe { destroy_instance(arena).unwrap() };
}

// =============================================================================
// BATCH: many live blocks, released in reverse
// =============================================================================

fn bench_batch(c: &mut Criterion) {
    let arena = create_instance(&ArenaConfig::default()).unwrap();
    let mut group = c.benchmark_group("batch_1000");
    let mut live = Vec::with_capacity(1000);

    group.bench_function("mixed_sizes", |b| {
        b.iter(|| unsafe {
            for i in 0..1000usize {
                live.push(arena.allocate(16 + (i * 61) % 2048));
            }
            while let Some(p) = live.pop() {
                arena.release(p);
            }
        });
    });

    group.bench_function("resize_doubling", |b| {
        b.iter(|| unsafe {
            let mut p = arena.allocate(16);
            let mut size = 16;
            while size < kb(256) {
                size *= 2;
                p = arena.resize(p, size);
            }
            arena.release(black_box(p));
        });
    });

    group.finish();
    unsafe { destroy_instance(arena).unwrap() };
}

// =============================================================================
// GROWTH: region map and unmap on every iteration
// =============================================================================

fn bench_region_churn(c: &mut Criterion) {
    let arena = create_instance(&ArenaConfig::minimal()).unwrap();
    // Keep the first region busy so the second is unmapped when it empties.
    let anchor = arena.allocate(kb(900));

    c.bench_function("region_churn", |b| {
        b.iter(|| unsafe {
            let p = arena.allocate(kb(512));
            arena.release(black_box(p));
        });
    });

    unsafe {
        arena.release(anchor);
        destroy_instance(arena).unwrap();
    }
}

criterion_group!(benches, bench_single_alloc, bench_batch, bench_region_churn);
criterion_main!(benches);
