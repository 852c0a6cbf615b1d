//! Sharded transfer caches, one shard per L3 cache domain.
//!
//! High-traffic size classes can contend hard on a single per-class
//! spinlock. This layer gives each L3 domain its own full set of
//! per-size-class caches and routes every operation through the calling
//! CPU's shard. The shards drain into and refill from one shared
//! unsharded [`TransferCacheManager`], which remains the system of
//! record.
//!
//! Shards are built lazily on first touch: machines rarely run threads
//! on every L3 domain, and an untouched shard costs nothing.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{MAX_CPUS, SHARDED_CLASS_BYTE_BUDGET, SHARDED_MIN_SIZE};
use crate::freelist::FreeList;
use crate::manager::TransferCacheManager;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::stats::TransferCacheStats;
use crate::sync::InitOnce;
use crate::transfer_cache::{Capacity, TransferCache, capacity_needed};

/// CPU topology provider: identifies the calling CPU and how CPUs group
/// into L3 cache domains.
pub trait CpuLayout {
    /// The CPU the calling thread is currently running on.
    fn current_cpu(&self) -> usize;

    /// Fill `map[cpu]` with the shard index of every CPU. Returns the
    /// number of shards (at least 1). Called once at manager
    /// construction.
    fn build_cache_map(&self, map: &mut [u8; MAX_CPUS]) -> usize;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        unsafe extern "C" {
            fn sched_getcpu() -> i32;
        }
    }
}

/// Production topology source.
///
/// The current CPU comes from `sched_getcpu(2)`. The CPU-to-shard map is
/// read from the kernel's L3 cache description in sysfs when `std` is
/// available; otherwise everything maps to a single shard.
#[derive(Default)]
pub struct ProdCpuLayout;

impl CpuLayout for ProdCpuLayout {
    fn current_cpu(&self) -> usize {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                let cpu = unsafe { sched_getcpu() };
                if cpu < 0 { 0 } else { cpu as usize }
            } else {
                0
            }
        }
    }

    fn build_cache_map(&self, map: &mut [u8; MAX_CPUS]) -> usize {
        cfg_if::cfg_if! {
            if #[cfg(all(target_os = "linux", feature = "std"))] {
                sysfs_cache_map(map)
            } else {
                map.fill(0);
                1
            }
        }
    }
}

/// CPUs sharing an L3 report identical `shared_cpu_list` contents; each
/// distinct list becomes one shard.
#[cfg(all(target_os = "linux", feature = "std"))]
fn sysfs_cache_map(map: &mut [u8; MAX_CPUS]) -> usize {
    use alloc::format;
    use alloc::string::String;

    map.fill(0);
    let mut lists: Vec<String> = Vec::new();
    for cpu in 0..MAX_CPUS {
        let path = format!("/sys/devices/system/cpu/cpu{cpu}/cache/index3/shared_cpu_list");
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let contents = contents.trim();
                let shard = match lists.iter().position(|l| l == contents) {
                    Some(i) => i,
                    None => {
                        lists.push(String::from(contents));
                        lists.len() - 1
                    }
                };
                map[cpu] = shard.min(u8::MAX as usize) as u8;
            }
            // CPUs are numbered contiguously; the first absent entry ends
            // the scan. A machine with no L3 description gets one shard.
            Err(_) => break,
        }
    }
    lists.len().max(1)
}

/// Which size classes get a sharded cache.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ShardedMode {
    /// Every size class, with the same scaled capacities as the
    /// unsharded caches.
    Generic,
    /// Only classes of at least `SHARDED_MIN_SIZE` bytes, each given a
    /// fixed `SHARDED_CLASS_BYTE_BUDGET` worth of slots.
    LargeClassesOnly,
}

/// Construction-time policy for the sharded layer. Evaluated once; there
/// is no process-global tuning state.
#[derive(Clone, Copy, Debug)]
pub struct ShardedOptions {
    pub mode: ShardedMode,
}

impl Default for ShardedOptions {
    fn default() -> Self {
        Self {
            mode: ShardedMode::LargeClassesOnly,
        }
    }
}

/// Free-list adapter: a shard's caches drain into and refill from the
/// unsharded manager, making it the shards' common backing pool.
pub struct BackingTransferCache<'a, F: FreeList> {
    manager: &'a TransferCacheManager<F>,
    size_class: usize,
}

impl<F: FreeList> FreeList for BackingTransferCache<'_, F> {
    fn insert_range(&self, batch: &[*mut u8]) {
        self.manager.insert_range(self.size_class, batch);
    }

    fn remove_range(&self, batch: &mut [*mut u8]) -> usize {
        self.manager.remove_range(self.size_class, batch)
    }

    fn size_class(&self) -> usize {
        self.size_class
    }
}

type ShardCache<'a, F> = TransferCache<BackingTransferCache<'a, F>>;

/// One L3 domain's caches, built exactly once on first touch.
struct Shard<'a, F: FreeList> {
    gate: InitOnce,
    /// Written once by the gate winner; read only after the gate
    /// publishes Ready.
    caches: UnsafeCell<Option<Box<[ShardCache<'a, F>]>>>,
}

// SAFETY: `caches` is written exactly once inside the InitOnce gate and
// only read after the gate's Release/Acquire handoff. The caches hold
// shared references into the backing manager, hence the Sync bound on F.
unsafe impl<F: FreeList + Send + Sync> Send for Shard<'_, F> {}
unsafe impl<F: FreeList + Send + Sync> Sync for Shard<'_, F> {}

/// Transfer caches sharded per L3 domain, backed by the unsharded
/// manager.
pub struct ShardedTransferCacheManager<'a, F: FreeList, L: CpuLayout> {
    backing: &'a TransferCacheManager<F>,
    layout: L,
    mode: ShardedMode,
    /// Mapping from CPU to its L3 shard.
    l3_cache_index: Box<[u8; MAX_CPUS]>,
    shards: Box<[Shard<'a, F>]>,
    active_shards: AtomicUsize,
    active_for_class: [bool; NUM_SIZE_CLASSES],
}

impl<'a, F: FreeList, L: CpuLayout> ShardedTransferCacheManager<'a, F, L> {
    /// Discover the topology and set up empty shards. No caches are
    /// allocated until a CPU first touches its shard.
    pub fn new(
        backing: &'a TransferCacheManager<F>,
        layout: L,
        options: ShardedOptions,
    ) -> Self {
        let mut map = Box::new([0u8; MAX_CPUS]);
        let num_shards = layout.build_cache_map(&mut map).max(1);

        let shards: Box<[Shard<'a, F>]> = (0..num_shards)
            .map(|_| Shard {
                gate: InitOnce::new(),
                caches: UnsafeCell::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let mut active_for_class = [false; NUM_SIZE_CLASSES];
        for (cls, active) in active_for_class.iter_mut().enumerate() {
            let size = size_class::class_to_size(cls);
            *active = match options.mode {
                ShardedMode::Generic => size > 0,
                ShardedMode::LargeClassesOnly => size >= SHARDED_MIN_SIZE,
            };
        }

        Self {
            backing,
            layout,
            mode: options.mode,
            l3_cache_index: map,
            shards,
            active_shards: AtomicUsize::new(0),
            active_for_class,
        }
    }

    /// Whether `size_class` is served by the sharded cache at all.
    #[inline]
    pub fn should_use(&self, size_class: usize) -> bool {
        self.active_for_class[size_class]
    }

    /// Remove a single object, or null if neither the shard nor the
    /// backing tiers can supply one.
    pub fn pop(&self, size_class: usize) -> *mut u8 {
        let mut batch = [core::ptr::null_mut()];
        let got = self.get_cache(size_class).remove_range(&mut batch);
        if got == 1 {
            batch[0]
        } else {
            core::ptr::null_mut()
        }
    }

    /// Insert a single object.
    pub fn push(&self, size_class: usize, ptr: *mut u8) {
        self.get_cache(size_class).insert_range(&[ptr]);
    }

    /// Remove up to `batch.len()` objects via the calling CPU's shard.
    #[must_use]
    pub fn remove_range(&self, size_class: usize, batch: &mut [*mut u8]) -> usize {
        self.get_cache(size_class).remove_range(batch)
    }

    /// Insert a batch via the calling CPU's shard.
    pub fn insert_range(&self, size_class: usize, batch: &[*mut u8]) {
        self.get_cache(size_class).insert_range(batch);
    }

    /// Push cold objects from every initialized shard back to the
    /// backing manager. Untouched shards are skipped, not constructed.
    pub fn plunder(&self) {
        for shard in self.shards.iter() {
            let Some(caches) = self.shard_caches(shard) else {
                continue;
            };
            for cache in caches.iter() {
                cache.try_plunder();
            }
        }
    }

    /// Bytes currently cached across all initialized shards.
    pub fn total_bytes(&self) -> usize {
        let mut out = 0;
        for shard in self.shards.iter() {
            let Some(caches) = self.shard_caches(shard) else {
                continue;
            };
            for (cls, cache) in caches.iter().enumerate() {
                out += cache.tc_length() * size_class::class_to_size(cls);
            }
        }
        out
    }

    /// Cumulative stats for `size_class` over all initialized shards.
    /// Uninitialized shards have cached nothing and contribute zero.
    pub fn get_stats(&self, size_class: usize) -> TransferCacheStats {
        let mut stats = TransferCacheStats::default();
        for shard in self.shards.iter() {
            if let Some(caches) = self.shard_caches(shard) {
                stats.merge(&caches[size_class].get_stats());
            }
        }
        stats
    }

    /// Objects cached for `size_class` in the shard owning `cpu`.
    pub fn tc_length(&self, cpu: usize, size_class: usize) -> usize {
        let shard = &self.shards[self.l3_cache_index[cpu] as usize];
        match self.shard_caches(shard) {
            Some(caches) => caches[size_class].tc_length(),
            None => 0,
        }
    }

    pub fn shard_initialized(&self, shard: usize) -> bool {
        self.shards[shard].gate.is_ready()
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn num_active_shards(&self) -> usize {
        self.active_shards.load(Ordering::Relaxed)
    }

    /// Capacity policy for one shard cache.
    fn shard_capacity(&self, size_class: usize) -> Capacity {
        if !self.active_for_class[size_class] {
            return Capacity {
                capacity: 0,
                max_capacity: 0,
            };
        }
        match self.mode {
            ShardedMode::Generic => capacity_needed(size_class),
            ShardedMode::LargeClassesOnly => {
                let size = size_class::class_to_size(size_class);
                let capacity = (SHARDED_CLASS_BYTE_BUDGET / size) as u32;
                Capacity {
                    capacity,
                    max_capacity: capacity,
                }
            }
        }
    }

    /// The calling CPU's cache for `size_class`, constructing the shard
    /// on first touch.
    fn get_cache(&self, size_class: usize) -> &ShardCache<'a, F> {
        let cpu = self.layout.current_cpu();
        debug_assert!(cpu < MAX_CPUS);
        let shard_index = self.l3_cache_index[cpu] as usize;
        debug_assert!(shard_index < self.shards.len());
        let shard = &self.shards[shard_index];

        if !shard.gate.is_ready() {
            self.init_shard(shard);
        }

        // SAFETY: the gate is Ready, so `caches` was fully built and is
        // immutable from here on.
        let caches = unsafe { &*shard.caches.get() };
        match caches {
            Some(caches) => &caches[size_class],
            // The gate never publishes Ready before the array is stored.
            None => unreachable!(),
        }
    }

    #[cold]
    fn init_shard(&self, shard: &Shard<'a, F>) {
        shard.gate.call_once(|| {
            let caches: Vec<ShardCache<'a, F>> = (0..NUM_SIZE_CLASSES)
                .map(|cls| {
                    TransferCache::with_capacity(
                        BackingTransferCache {
                            manager: self.backing,
                            size_class: cls,
                        },
                        // Shard caches absorb single-object pushes and
                        // pops, so they always take partial sizes.
                        true,
                        self.shard_capacity(cls),
                    )
                })
                .collect();
            // SAFETY: the gate winner has exclusive access to `caches`
            // until Ready is published.
            unsafe { *shard.caches.get() = Some(caches.into_boxed_slice()) };
            self.active_shards.fetch_add(1, Ordering::Relaxed);
        });
    }

    /// A shard's cache array, or None if the shard was never touched.
    fn shard_caches<'s>(&'s self, shard: &'s Shard<'a, F>) -> Option<&'s [ShardCache<'a, F>]> {
        if !shard.gate.is_ready() {
            return None;
        }
        // SAFETY: Ready implies the array is built and immutable.
        unsafe { (*shard.caches.get()).as_deref() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freelist::MockFreeList;
    use crate::manager::ManagerOptions;

    fn obj(i: usize) -> *mut u8 {
        (0x1000 + i * 8) as *mut u8
    }

    /// Deterministic topology: `num_cpus` CPUs spread round-robin over
    /// `num_shards` shards, with the "current" CPU set by the test.
    struct FakeCpuLayout {
        num_cpus: usize,
        num_shards: usize,
        current: AtomicUsize,
    }

    impl FakeCpuLayout {
        fn new(num_cpus: usize, num_shards: usize) -> Self {
            Self {
                num_cpus,
                num_shards,
                current: AtomicUsize::new(0),
            }
        }
    }

    impl CpuLayout for &FakeCpuLayout {
        fn current_cpu(&self) -> usize {
            self.current.load(Ordering::Relaxed)
        }

        fn build_cache_map(&self, map: &mut [u8; MAX_CPUS]) -> usize {
            for cpu in 0..self.num_cpus {
                map[cpu] = (cpu % self.num_shards) as u8;
            }
            self.num_shards
        }
    }

    fn make_backing() -> TransferCacheManager<MockFreeList> {
        TransferCacheManager::new(ManagerOptions::default(), MockFreeList::new)
    }

    fn large_class() -> usize {
        (1..NUM_SIZE_CLASSES)
            .find(|&c| size_class::class_to_size(c) >= SHARDED_MIN_SIZE)
            .expect("size class table has no large classes")
    }

    #[test]
    fn test_policy_large_classes_only() {
        let backing = make_backing();
        let layout = FakeCpuLayout::new(4, 2);
        let sharded =
            ShardedTransferCacheManager::new(&backing, &layout, ShardedOptions::default());

        assert!(!sharded.should_use(0));
        for cls in 1..NUM_SIZE_CLASSES {
            assert_eq!(
                sharded.should_use(cls),
                size_class::class_to_size(cls) >= SHARDED_MIN_SIZE,
                "wrong policy for class {cls}"
            );
        }
    }

    #[test]
    fn test_policy_generic_covers_all_real_classes() {
        let backing = make_backing();
        let layout = FakeCpuLayout::new(4, 2);
        let sharded = ShardedTransferCacheManager::new(
            &backing,
            &layout,
            ShardedOptions {
                mode: ShardedMode::Generic,
            },
        );

        assert!(!sharded.should_use(0));
        for cls in 1..NUM_SIZE_CLASSES {
            assert!(sharded.should_use(cls));
        }
    }

    #[test]
    fn test_shards_initialize_lazily() {
        let backing = make_backing();
        let layout = FakeCpuLayout::new(4, 2);
        let sharded =
            ShardedTransferCacheManager::new(&backing, &layout, ShardedOptions::default());

        assert_eq!(sharded.num_shards(), 2);
        assert_eq!(sharded.num_active_shards(), 0);
        assert!(!sharded.shard_initialized(0));
        assert!(!sharded.shard_initialized(1));

        let cls = large_class();
        layout.current.store(0, Ordering::Relaxed);
        sharded.push(cls, obj(1));

        assert!(sharded.shard_initialized(0));
        assert!(!sharded.shard_initialized(1));
        assert_eq!(sharded.num_active_shards(), 1);
    }

    #[test]
    fn test_push_pop_round_trip_on_one_shard() {
        let backing = make_backing();
        let layout = FakeCpuLayout::new(4, 2);
        let sharded =
            ShardedTransferCacheManager::new(&backing, &layout, ShardedOptions::default());

        let cls = large_class();
        sharded.push(cls, obj(7));
        assert_eq!(sharded.tc_length(0, cls), 1);
        assert_eq!(sharded.total_bytes(), size_class::class_to_size(cls));

        assert_eq!(sharded.pop(cls), obj(7));
        assert_eq!(sharded.tc_length(0, cls), 0);
        assert!(sharded.pop(cls).is_null());
    }

    #[test]
    fn test_shards_are_independent() {
        let backing = make_backing();
        let layout = FakeCpuLayout::new(2, 2);
        let sharded =
            ShardedTransferCacheManager::new(&backing, &layout, ShardedOptions::default());
        let cls = large_class();

        // CPU 0 -> shard 0.
        layout.current.store(0, Ordering::Relaxed);
        sharded.push(cls, obj(1));

        // CPU 1 -> shard 1: its cache is empty, and the object is not in
        // the backing tiers either, so the pop comes up empty.
        layout.current.store(1, Ordering::Relaxed);
        assert!(sharded.pop(cls).is_null());
        assert_eq!(sharded.num_active_shards(), 2);

        // Back on shard 0 the object is still there.
        layout.current.store(0, Ordering::Relaxed);
        assert_eq!(sharded.pop(cls), obj(1));
    }

    #[test]
    fn test_inactive_class_forwards_to_backing() {
        let backing = make_backing();
        let layout = FakeCpuLayout::new(2, 1);
        let sharded =
            ShardedTransferCacheManager::new(&backing, &layout, ShardedOptions::default());

        // Class 1 is below the large-class threshold: its shard cache has
        // zero capacity and every push lands in the backing manager.
        let cls = 1;
        assert!(!sharded.should_use(cls));
        sharded.push(cls, obj(3));
        assert_eq!(sharded.tc_length(0, cls), 0);
        assert_eq!(backing.tc_length(cls), 0);
        assert_eq!(backing.freelist(cls).len(), 1);
    }

    #[test]
    fn test_plunder_skips_untouched_shards() {
        let backing = make_backing();
        let layout = FakeCpuLayout::new(4, 4);
        let sharded =
            ShardedTransferCacheManager::new(&backing, &layout, ShardedOptions::default());
        let cls = large_class();

        sharded.push(cls, obj(9));
        assert_eq!(sharded.num_active_shards(), 1);

        sharded.plunder(); // arms the low water mark
        sharded.plunder(); // idle for a cycle: released to the backing tiers
        assert_eq!(sharded.num_active_shards(), 1);
        assert_eq!(sharded.total_bytes(), 0);

        // The object survived the trip down: the backing manager's class
        // cache rejected the partial batch, so it sits in the free list.
        assert_eq!(backing.freelist(cls).len(), 1);
    }

    #[test]
    fn test_get_stats_aggregates_initialized_shards() {
        let backing = make_backing();
        let layout = FakeCpuLayout::new(2, 2);
        let sharded =
            ShardedTransferCacheManager::new(&backing, &layout, ShardedOptions::default());
        let cls = large_class();

        layout.current.store(0, Ordering::Relaxed);
        sharded.push(cls, obj(1));
        layout.current.store(1, Ordering::Relaxed);
        sharded.push(cls, obj(2));

        let stats = sharded.get_stats(cls);
        assert_eq!(stats.insert_hits, 2);
        assert_eq!(stats.used, 2);
        // Two shards' worth of capacity in the aggregate.
        assert_eq!(
            stats.capacity,
            2 * (SHARDED_CLASS_BYTE_BUDGET / size_class::class_to_size(cls))
        );
    }

    #[test]
    fn test_concurrent_first_touch_builds_shard_once() {
        use std::thread;

        let backing = make_backing();
        let layout = FakeCpuLayout::new(1, 1);
        let sharded =
            ShardedTransferCacheManager::new(&backing, &layout, ShardedOptions::default());
        let cls = large_class();

        thread::scope(|s| {
            for t in 0..8 {
                let sharded = &sharded;
                s.spawn(move || {
                    for i in 0..100 {
                        sharded.push(cls, obj(1 + t * 1000 + i));
                    }
                });
            }
        });

        assert_eq!(sharded.num_active_shards(), 1);
        // Nothing lost between the shard cache and the backing tiers.
        let cached = sharded.tc_length(0, cls);
        let backed = backing.tc_length(cls) + backing.freelist(cls).len();
        assert_eq!(cached + backed, 800);
    }
}
