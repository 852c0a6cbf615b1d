//! Transfer cache: per-size-class batch cache between allocation fast
//! paths and the backing central free list.
//!
//! Each cache is a fixed-size array of object pointers used as a LIFO
//! stack, guarded by a spinlock. Full batches move in and out with one
//! lock acquisition and a memcpy; anything the cache cannot absorb or
//! supply falls through to the backing free list, and the miss is counted
//! so the manager's resize pass can move capacity toward busy classes.
//!
//! `(used, capacity)` is additionally mirrored in a packed atomic so the
//! fast paths can pre-check occupancy without the lock; every mutation
//! re-validates under it.

use alloc::boxed::Box;
use alloc::vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::{
    CLASS_BYTE_BUDGET, INITIAL_CAPACITY_IN_BATCHES, MAX_CAPACITY_IN_BATCHES, MAX_OBJECTS_TO_MOVE,
};
use crate::freelist::FreeList;
use crate::size_class;
use crate::stats::{MissCounter, TransferCacheStats};
use crate::sync::SpinMutex;

/// Occupancy and logical capacity of the slot array, packed into one
/// atomic word so unlocked readers always see the two fields together.
///
/// INVARIANT: `used <= capacity <= max_capacity`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SizeInfo {
    pub used: u32,
    pub capacity: u32,
}

impl SizeInfo {
    #[inline]
    fn pack(self) -> u64 {
        ((self.capacity as u64) << 32) | self.used as u64
    }

    #[inline]
    fn unpack(raw: u64) -> Self {
        Self {
            used: raw as u32,
            capacity: (raw >> 32) as u32,
        }
    }
}

/// Initial and maximum capacity for one cache, in objects.
#[derive(Clone, Copy, Debug)]
pub struct Capacity {
    pub capacity: u32,
    pub max_capacity: u32,
}

/// Compute the capacity to configure a cache for `size_class`.
///
/// Large size classes would pin a lot of memory just sitting in the
/// cache, so the maximum is capped near `CLASS_BYTE_BUDGET` bytes per
/// class while always leaving room for at least one batch. The sentinel
/// class gets a disabled cache.
pub fn capacity_needed(size_class: usize) -> Capacity {
    let bytes = size_class::class_to_size(size_class);
    if size_class == 0 || bytes == 0 {
        return Capacity {
            capacity: 0,
            max_capacity: 0,
        };
    }

    let b = size_class::batch_size(size_class);
    debug_assert!(b >= 2);

    let mut max_capacity = MAX_CAPACITY_IN_BATCHES * b;
    max_capacity = max_capacity.min(b.max(CLASS_BYTE_BUDGET / (bytes * b) * b));
    let capacity = (INITIAL_CAPACITY_IN_BATCHES * b).min(max_capacity);

    Capacity {
        capacity: capacity as u32,
        max_capacity: max_capacity as u32,
    }
}

/// Lock-protected part of the cache: the slot array itself and the
/// plunder bookkeeping.
struct Slots {
    /// Flat LIFO stack: entries `[0, used)` hold valid object pointers.
    /// Allocated once at construction, length `max_capacity`.
    slots: Box<[*mut u8]>,
    /// Minimum `used` observed since the last plunder pass.
    low_water_mark: u32,
}

// SAFETY: only accessed through the enclosing SpinMutex.
unsafe impl Send for Slots {}

/// Per-size-class transfer cache in front of a backing free list `F`.
pub struct TransferCache<F: FreeList> {
    /// Hard bound on `capacity`. Fixed at construction.
    max_capacity: u32,
    /// Objects moved per batch for this size class.
    batch: u32,
    /// Accept partial (non-batch-sized) transfers.
    flexible: bool,
    /// Packed [`SizeInfo`]; written under the lock, readable without it.
    slot_info: AtomicU64,
    slots: SpinMutex<Slots>,
    // Hit counters are only bumped while holding the lock; miss counters
    // are bumped lock-free.
    insert_hits: AtomicU64,
    remove_hits: AtomicU64,
    insert_misses: MissCounter,
    insert_non_batch_misses: MissCounter,
    remove_misses: MissCounter,
    remove_non_batch_misses: MissCounter,
    freelist: F,
}

impl<F: FreeList> TransferCache<F> {
    /// Build a cache for `freelist.size_class()` with the default
    /// capacity policy.
    pub fn new(freelist: F, flexible: bool) -> Self {
        let capacity = capacity_needed(freelist.size_class());
        Self::with_capacity(freelist, flexible, capacity)
    }

    /// Build a cache with an explicit capacity (the sharded layer uses
    /// its own policy).
    pub fn with_capacity(freelist: F, flexible: bool, capacity: Capacity) -> Self {
        debug_assert!(capacity.capacity <= capacity.max_capacity);
        let batch = size_class::batch_size(freelist.size_class()) as u32;
        Self {
            max_capacity: capacity.max_capacity,
            batch,
            flexible,
            slot_info: AtomicU64::new(
                SizeInfo {
                    used: 0,
                    capacity: capacity.capacity,
                }
                .pack(),
            ),
            slots: SpinMutex::new(Slots {
                slots: vec![core::ptr::null_mut(); capacity.max_capacity as usize]
                    .into_boxed_slice(),
                low_water_mark: 0,
            }),
            insert_hits: AtomicU64::new(0),
            remove_hits: AtomicU64::new(0),
            insert_misses: MissCounter::new(),
            insert_non_batch_misses: MissCounter::new(),
            remove_misses: MissCounter::new(),
            remove_non_batch_misses: MissCounter::new(),
            freelist,
        }
    }

    /// Insert `batch` into the cache, falling through to the backing free
    /// list if it does not fit. Either way, every object remains
    /// retrievable by a later `remove_range`.
    ///
    /// Callers pass at most one batch (`batch_size` objects) at a time.
    pub fn insert_range(&self, batch: &[*mut u8]) {
        let n = batch.len() as u32;
        debug_assert!(n > 0);
        debug_assert!(self.batch == 0 || n <= self.batch);

        if n == self.batch || self.flexible {
            // Unlocked pre-check against the hard bound; capacity itself
            // is re-read under the lock since the resize pass may have
            // shrunk it concurrently.
            if self.slot_info().used + n <= self.max_capacity {
                let mut guard = self.slots.lock();
                let mut info = self.slot_info();
                if info.capacity - info.used >= n {
                    let base = info.used as usize;
                    guard.slots[base..base + n as usize].copy_from_slice(batch);
                    info.used += n;
                    self.set_slot_info(info);
                    self.insert_hits.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
            self.insert_misses.inc();
        } else {
            self.insert_non_batch_misses.inc();
        }

        self.freelist.insert_range(batch);
    }

    /// Fill `batch` from the cache (LIFO), falling through to the backing
    /// free list on a miss. Returns the number of objects actually
    /// delivered, which may be less than requested (zero when the
    /// backing list is drained too).
    #[must_use]
    pub fn remove_range(&self, batch: &mut [*mut u8]) -> usize {
        let n = batch.len() as u32;
        debug_assert!(n > 0);

        if n == self.batch || self.flexible {
            if self.slot_info().used >= n {
                let mut guard = self.slots.lock();
                let mut info = self.slot_info();
                if info.used >= n {
                    info.used -= n;
                    self.set_slot_info(info);
                    let base = info.used as usize;
                    batch.copy_from_slice(&guard.slots[base..base + n as usize]);
                    self.remove_hits.fetch_add(1, Ordering::Relaxed);
                    guard.low_water_mark = guard.low_water_mark.min(info.used);
                    return n as usize;
                }
            }
            self.remove_misses.inc();
        } else {
            self.remove_non_batch_misses.inc();
        }

        self.freelist.remove_range(batch)
    }

    /// Return cold objects to the backing free list.
    ///
    /// The low water mark records the minimum occupancy since the last
    /// plunder; those objects went a full maintenance interval without
    /// being handed out, so they are released in batch-sized chunks from
    /// the top of the stack. Uses try-lock throughout: if a fast-path
    /// operation holds the lock, this cycle is simply skipped.
    pub fn try_plunder(&self) {
        if self.max_capacity == 0 {
            return;
        }
        let Some(mut guard) = self.slots.try_lock() else {
            return;
        };

        let mut to_return = guard.low_water_mark;
        let info = self.slot_info();
        debug_assert!(to_return <= info.used);
        guard.low_water_mark = info.used;

        loop {
            let mut info = self.slot_info();
            let num_to_move = self.batch.min(info.used).min(to_return);
            if num_to_move == 0 {
                break;
            }

            // The slot array may be overwritten as soon as the lock
            // drops, so stage the released entries on the stack.
            let mut buf = [core::ptr::null_mut::<u8>(); MAX_OBJECTS_TO_MOVE];
            let base = (info.used - num_to_move) as usize;
            buf[..num_to_move as usize]
                .copy_from_slice(&guard.slots[base..base + num_to_move as usize]);
            info.used -= num_to_move;
            to_return -= num_to_move;
            guard.low_water_mark = info.used;
            self.set_slot_info(info);
            drop(guard);

            self.freelist.insert_range(&buf[..num_to_move as usize]);

            guard = match self.slots.try_lock() {
                Some(g) => g,
                None => return,
            };
        }
    }

    /// Grow the logical capacity by one batch. Fails once `max_capacity`
    /// is reached. No data moves; growing only widens the bound.
    pub fn increase_capacity(&self) -> bool {
        let n = self.batch;
        if n == 0 {
            return false;
        }
        let _guard = self.slots.lock();
        let mut info = self.slot_info();
        if info.capacity + n > self.max_capacity {
            return false;
        }
        info.capacity += n;
        self.set_slot_info(info);
        true
    }

    /// Whether the capacity could grow by one more batch. Unlocked hint
    /// for the resize pass.
    pub fn can_increase_capacity(&self) -> bool {
        let n = self.batch;
        n > 0 && self.max_capacity - self.slot_info().capacity >= n
    }

    /// Whether at least one batch worth of slots is unoccupied. Unlocked
    /// hint for the resize pass.
    pub fn has_spare_capacity(&self) -> bool {
        let n = self.batch;
        let info = self.slot_info();
        n > 0 && info.capacity - info.used >= n
    }

    /// Drop the logical capacity by one batch, evicting cached objects to
    /// the backing free list if occupancy exceeds the new bound. Fails if
    /// there is less than a batch of capacity to give up.
    pub fn shrink(&self) -> bool {
        let n = self.batch;
        if n == 0 {
            return false;
        }

        let mut evicted = [core::ptr::null_mut::<u8>(); MAX_OBJECTS_TO_MOVE];
        let num_evicted: usize;
        {
            let mut guard = self.slots.lock();
            let mut info = self.slot_info();
            if info.capacity < n {
                return false;
            }

            let unused = info.capacity - info.used;
            if n <= unused {
                info.capacity -= n;
                self.set_slot_info(info);
                return true;
            }

            let evict = n - unused;
            info.capacity -= n;
            info.used -= evict;
            self.set_slot_info(info);
            guard.low_water_mark = guard.low_water_mark.min(info.used);

            // Copy out before dropping the lock; the freed slots may be
            // reused immediately by a concurrent insert.
            let base = info.used as usize;
            evicted[..evict as usize]
                .copy_from_slice(&guard.slots[base..base + evict as usize]);
            num_evicted = evict as usize;
        }

        self.freelist.insert_range(&evicted[..num_evicted]);
        true
    }

    /// Number of objects currently cached. Best-effort racy read.
    #[inline]
    pub fn tc_length(&self) -> usize {
        self.slot_info().used as usize
    }

    #[inline]
    pub fn max_capacity(&self) -> u32 {
        self.max_capacity
    }

    #[inline]
    pub fn slot_info(&self) -> SizeInfo {
        SizeInfo::unpack(self.slot_info.load(Ordering::Relaxed))
    }

    /// The backing free list. Never called while the cache lock is held.
    #[inline]
    pub fn freelist(&self) -> &F {
        &self.freelist
    }

    /// Misses of every kind accumulated since the previous call, and
    /// commit them. Feeds the interval-based resize decisions.
    pub fn fetch_commit_interval_misses(&self) -> u64 {
        self.insert_misses.commit()
            + self.insert_non_batch_misses.commit()
            + self.remove_misses.commit()
            + self.remove_non_batch_misses.commit()
    }

    /// Snapshot the cache's counters and occupancy.
    pub fn get_stats(&self) -> TransferCacheStats {
        let info = self.slot_info();
        let insert_non_batch = self.insert_non_batch_misses.total();
        let remove_non_batch = self.remove_non_batch_misses.total();
        TransferCacheStats {
            insert_hits: self.insert_hits.load(Ordering::Relaxed),
            insert_misses: self.insert_misses.total() + insert_non_batch,
            insert_non_batch_misses: insert_non_batch,
            remove_hits: self.remove_hits.load(Ordering::Relaxed),
            remove_misses: self.remove_misses.total() + remove_non_batch,
            remove_non_batch_misses: remove_non_batch,
            used: info.used as usize,
            capacity: info.capacity as usize,
            max_capacity: self.max_capacity as usize,
        }
    }

    #[inline]
    fn set_slot_info(&self, info: SizeInfo) {
        debug_assert!(info.used <= info.capacity);
        debug_assert!(info.capacity <= self.max_capacity);
        self.slot_info.store(info.pack(), Ordering::Relaxed);
    }
}
