//! Hit/miss counters and stat snapshots for the transfer caches.
//!
//! Everything here uses `Relaxed` atomics: the counters carry no
//! synchronization duties (the per-cache spinlock does), they only feed
//! the periodic resize pass and monitoring, where eventual totals are all
//! that matters.

use core::sync::atomic::{AtomicU64, Ordering};

/// A miss counter with an interval-commit operation.
///
/// `inc` is lock-free and may be called from any thread. `commit` returns
/// the misses accumulated since the previous commit without resetting
/// `total`, so concurrent readers of the running total are undisturbed.
pub struct MissCounter {
    total: AtomicU64,
    committed: AtomicU64,
}

impl Default for MissCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl MissCounter {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            committed: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Misses since the previous commit. A counter wraparound reads as 0
    /// rather than a huge delta.
    pub fn commit(&self) -> u64 {
        let t = self.total.load(Ordering::Relaxed);
        let c = self.committed.swap(t, Ordering::Relaxed);
        t.saturating_sub(c)
    }
}

/// A point-in-time snapshot of one transfer cache's counters and occupancy.
///
/// Fields are loaded individually with `Relaxed` ordering; the snapshot as
/// a whole is not globally consistent with concurrent operations, which is
/// sufficient for monitoring. As with the occupancy fields, `insert_misses`
/// and `remove_misses` include their non-batch components, which are also
/// broken out separately.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferCacheStats {
    /// Batches absorbed by the slot array.
    pub insert_hits: u64,
    /// Inserts that fell through to the backing free list.
    pub insert_misses: u64,
    /// Inserts rejected for being partial (non-batch-sized).
    pub insert_non_batch_misses: u64,
    /// Batches served from the slot array.
    pub remove_hits: u64,
    /// Removes that fell through to the backing free list.
    pub remove_misses: u64,
    /// Removes rejected for being partial (non-batch-sized).
    pub remove_non_batch_misses: u64,
    /// Objects currently cached.
    pub used: usize,
    /// Current logical capacity in objects.
    pub capacity: usize,
    /// Hard capacity bound in objects.
    pub max_capacity: usize,
}

impl TransferCacheStats {
    /// Fold another snapshot into this one (per-shard aggregation).
    pub fn merge(&mut self, other: &TransferCacheStats) {
        self.insert_hits += other.insert_hits;
        self.insert_misses += other.insert_misses;
        self.insert_non_batch_misses += other.insert_non_batch_misses;
        self.remove_hits += other.remove_hits;
        self.remove_misses += other.remove_misses;
        self.remove_non_batch_misses += other.remove_non_batch_misses;
        self.used += other.used;
        self.capacity += other.capacity;
        self.max_capacity += other.max_capacity;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_returns_interval_delta() {
        let c = MissCounter::new();
        c.inc();
        c.inc();
        c.inc();
        assert_eq!(c.total(), 3);
        assert_eq!(c.commit(), 3);
        // Already committed: an immediate second commit sees no new misses.
        assert_eq!(c.commit(), 0);

        c.inc();
        assert_eq!(c.commit(), 1);
        assert_eq!(c.total(), 4);
    }

    #[test]
    fn test_commit_does_not_reset_total() {
        let c = MissCounter::new();
        c.inc();
        let _ = c.commit();
        assert_eq!(c.total(), 1);
    }

    #[test]
    fn test_merge_sums_all_fields() {
        let mut a = TransferCacheStats {
            insert_hits: 1,
            insert_misses: 2,
            insert_non_batch_misses: 3,
            remove_hits: 4,
            remove_misses: 5,
            remove_non_batch_misses: 6,
            used: 7,
            capacity: 8,
            max_capacity: 9,
        };
        let b = a;
        a.merge(&b);
        assert_eq!(a.insert_hits, 2);
        assert_eq!(a.remove_non_batch_misses, 12);
        assert_eq!(a.max_capacity, 18);
    }
}
