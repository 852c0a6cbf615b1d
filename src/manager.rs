//! Per-size-class cache array and the periodic capacity rebalancing pass.
//!
//! The manager owns one [`TransferCache`] per size class and forwards the
//! fast-path operations by class index. A background driver calls
//! [`TransferCacheManager::try_resizing_caches`] periodically to move
//! capacity from quiet classes toward the ones that missed, and
//! [`TransferCacheManager::plunder`] to push cold objects back to the
//! backing free lists.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::config::MAX_CLASSES_TO_RESIZE;
use crate::freelist::FreeList;
use crate::size_class::NUM_SIZE_CLASSES;
use crate::stats::TransferCacheStats;
use crate::transfer_cache::TransferCache;

/// Construction-time policy for the manager. Evaluated once; there is no
/// process-global tuning state.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManagerOptions {
    /// Let the caches absorb partial (non-batch-sized) transfers instead
    /// of forwarding them.
    pub partial_transfers: bool,
}

/// One transfer cache per size class, plus the rebalancing machinery.
pub struct TransferCacheManager<F: FreeList> {
    caches: Box<[TransferCache<F>]>,
}

impl<F: FreeList> TransferCacheManager<F> {
    /// Build one cache per size class. `make_freelist` constructs the
    /// backing free list bound to each class, index 0 (the sentinel)
    /// included.
    pub fn new(options: ManagerOptions, mut make_freelist: impl FnMut(usize) -> F) -> Self {
        let mut caches = Vec::with_capacity(NUM_SIZE_CLASSES);
        for cls in 0..NUM_SIZE_CLASSES {
            let freelist = make_freelist(cls);
            debug_assert_eq!(freelist.size_class(), cls);
            caches.push(TransferCache::new(freelist, options.partial_transfers));
        }
        Self {
            caches: caches.into_boxed_slice(),
        }
    }

    /// Insert a batch for `size_class`; overflow forwards to the backing
    /// free list.
    pub fn insert_range(&self, size_class: usize, batch: &[*mut u8]) {
        self.caches[size_class].insert_range(batch);
    }

    /// Remove up to `batch.len()` objects for `size_class`. Returns the
    /// count actually delivered.
    #[must_use]
    pub fn remove_range(&self, size_class: usize, batch: &mut [*mut u8]) -> usize {
        self.caches[size_class].remove_range(batch)
    }

    /// Objects currently cached for `size_class`. Best-effort racy read.
    pub fn tc_length(&self, size_class: usize) -> usize {
        self.caches[size_class].tc_length()
    }

    pub fn has_spare_capacity(&self, size_class: usize) -> bool {
        self.caches[size_class].has_spare_capacity()
    }

    pub fn can_increase_capacity(&self, size_class: usize) -> bool {
        self.caches[size_class].can_increase_capacity()
    }

    pub fn increase_cache_capacity(&self, size_class: usize) -> bool {
        self.caches[size_class].increase_capacity()
    }

    pub fn shrink_cache(&self, size_class: usize) -> bool {
        self.caches[size_class].shrink()
    }

    pub fn fetch_commit_interval_misses(&self, size_class: usize) -> u64 {
        self.caches[size_class].fetch_commit_interval_misses()
    }

    pub fn get_stats(&self, size_class: usize) -> TransferCacheStats {
        self.caches[size_class].get_stats()
    }

    /// The backing free list for `size_class`.
    pub fn freelist(&self, size_class: usize) -> &F {
        self.caches[size_class].freelist()
    }

    /// Release cold objects across every class. Skips any cache whose
    /// lock is contended.
    pub fn plunder(&self) {
        for cache in self.caches.iter() {
            cache.try_plunder();
        }
    }

    /// Rebalance capacity across size classes based on the misses each
    /// incurred since the previous pass.
    ///
    /// Classes are ranked by interval miss count; the hungriest grow by
    /// one batch each, paired against a shrink of the quietest class with
    /// slack, until `MAX_CLASSES_TO_RESIZE` classes have grown or nobody
    /// with misses is left. Best-effort throughout: a class that cannot
    /// grow or shrink is skipped, never retried within the pass.
    pub fn try_resizing_caches(&self) {
        #[derive(Clone, Copy)]
        struct MissInfo {
            size_class: usize,
            misses: u64,
        }

        let mut misses: [MissInfo; NUM_SIZE_CLASSES] = core::array::from_fn(|cls| MissInfo {
            size_class: cls,
            misses: self.fetch_commit_interval_misses(cls),
        });

        // Most misses first; ties resolve to the lower class index so the
        // pass is deterministic.
        misses.sort_unstable_by(|a, b| {
            b.misses
                .cmp(&a.misses)
                .then(a.size_class.cmp(&b.size_class))
        });

        let mut total_grown = 0usize;
        let mut total_shrunk = 0usize;
        let mut to_grow = 0usize;
        let mut to_shrink = NUM_SIZE_CLASSES - 1;

        while to_grow < to_shrink {
            if total_grown == MAX_CLASSES_TO_RESIZE {
                break;
            }
            if !self.can_increase_capacity(misses[to_grow].size_class) {
                // Saturated grow candidate: pass over it without
                // consuming a shrink candidate.
                to_grow += 1;
                continue;
            }
            // No one else wants to grow, so stop here.
            if misses[to_grow].misses == 0 {
                break;
            }

            // Scan from the quiet end for a cache that can actually give
            // up a batch.
            while to_grow < to_shrink {
                if self.shrink_cache(misses[to_shrink].size_class) {
                    total_shrunk += 1;
                    break;
                }
                to_shrink -= 1;
            }

            while to_grow < to_shrink {
                if self.increase_cache_capacity(misses[to_grow].size_class) {
                    total_grown += 1;
                    break;
                }
                to_grow += 1;
            }

            to_grow += 1;
            to_shrink = to_shrink.saturating_sub(1);
        }

        // A successful shrink whose paired growth failed would quietly
        // leak a batch of aggregate capacity. Hand the difference to any
        // class with headroom; the shrunk classes themselves always
        // qualify, so this terminates.
        while total_grown < total_shrunk {
            for i in 0..NUM_SIZE_CLASSES {
                if self.increase_cache_capacity(misses[i].size_class) {
                    total_grown += 1;
                    break;
                }
            }
        }
    }
}
