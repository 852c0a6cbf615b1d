//! Microbenchmarks for the transfer cache hot paths.
//!
//! The interesting costs are the lock-plus-memcpy hit path, the counted
//! miss fall-through, and the periodic resize pass. Everything runs
//! against the mock free list so only cache overhead is measured.

use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use xfercache::freelist::MockFreeList;
use xfercache::size_class;
use xfercache::{ManagerOptions, TransferCacheManager};

fn obj(i: usize) -> *mut u8 {
    (0x1000 + i * 8) as *mut u8
}

fn make_manager() -> TransferCacheManager<MockFreeList> {
    TransferCacheManager::new(ManagerOptions::default(), MockFreeList::new)
}

/// Batch insert immediately followed by batch remove, all hits.
fn bench_hit_path(c: &mut Criterion) {
    let manager = make_manager();
    let cls = 1;
    let b = size_class::batch_size(cls);
    let batch: Vec<*mut u8> = (0..b).map(obj).collect();
    let mut out = vec![std::ptr::null_mut(); b];

    c.bench_function("insert_remove_hit", |bench| {
        bench.iter(|| {
            manager.insert_range(cls, black_box(&batch));
            let got = manager.remove_range(cls, black_box(&mut out));
            assert_eq!(got, b);
        })
    });
}

/// Remove against an empty cache and empty backing list: the pure miss
/// accounting and fall-through cost.
fn bench_miss_path(c: &mut Criterion) {
    let manager = make_manager();
    let cls = 1;
    let b = size_class::batch_size(cls);
    let mut out = vec![std::ptr::null_mut(); b];

    c.bench_function("remove_miss_empty", |bench| {
        bench.iter(|| {
            let got = manager.remove_range(cls, black_box(&mut out));
            assert_eq!(got, 0);
        })
    });
}

/// One full rebalancing pass over all size classes, no misses pending.
fn bench_resize_pass(c: &mut Criterion) {
    let manager = make_manager();

    c.bench_function("try_resizing_caches_idle", |bench| {
        bench.iter(|| {
            manager.try_resizing_caches();
        })
    });
}

criterion_group!(benches, bench_hit_path, bench_miss_path, bench_resize_pass);
criterion_main!(benches);
