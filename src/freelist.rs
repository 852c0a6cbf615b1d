//! Backing free list interface.
//!
//! The transfer cache buffers in front of a per-size-class central free
//! list. That list lives outside this crate and is consumed through the
//! [`FreeList`] trait; the sharded layer also implements it internally so
//! shards can drain into the unsharded manager.

/// A per-size-class pool of free objects.
///
/// Implementors are bound to one size class at construction (this crate's
/// equivalent of a separate one-time `Init` call). Objects are opaque
/// pointers; the free list is the system of record for them.
pub trait FreeList {
    /// Accept every object in `batch`. The free list has unbounded
    /// capacity from the cache's perspective; this cannot fail.
    fn insert_range(&self, batch: &[*mut u8]);

    /// Fill `batch` from the pool, returning how many objects were
    /// actually supplied. A short (or zero) count means the pool could
    /// not cover the request; it is not an error.
    fn remove_range(&self, batch: &mut [*mut u8]) -> usize;

    /// The size class this list serves.
    fn size_class(&self) -> usize;
}

#[cfg(any(test, feature = "testing"))]
pub use mock::MockFreeList;

#[cfg(any(test, feature = "testing"))]
mod mock {
    use super::FreeList;
    use crate::sync::SpinMutex;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicU64, Ordering};

    /// An unbounded in-memory free list for tests and benches.
    ///
    /// Objects are held LIFO. Call counters let tests assert exactly when
    /// the cache fell through.
    pub struct MockFreeList {
        size_class: usize,
        pool: SpinMutex<Vec<*mut u8>>,
        insert_calls: AtomicU64,
        remove_calls: AtomicU64,
    }

    // SAFETY: the pool is only touched under the SpinMutex; the pointers
    // themselves are opaque tokens that are never dereferenced.
    unsafe impl Send for MockFreeList {}
    unsafe impl Sync for MockFreeList {}

    impl MockFreeList {
        pub fn new(size_class: usize) -> Self {
            Self {
                size_class,
                pool: SpinMutex::new(Vec::new()),
                insert_calls: AtomicU64::new(0),
                remove_calls: AtomicU64::new(0),
            }
        }

        /// Pre-populate the pool with `objects`.
        pub fn seed(&self, objects: &[*mut u8]) {
            self.pool.lock().extend_from_slice(objects);
        }

        pub fn len(&self) -> usize {
            self.pool.lock().len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        pub fn insert_calls(&self) -> u64 {
            self.insert_calls.load(Ordering::Relaxed)
        }

        pub fn remove_calls(&self) -> u64 {
            self.remove_calls.load(Ordering::Relaxed)
        }
    }

    impl FreeList for MockFreeList {
        fn insert_range(&self, batch: &[*mut u8]) {
            self.insert_calls.fetch_add(1, Ordering::Relaxed);
            self.pool.lock().extend_from_slice(batch);
        }

        fn remove_range(&self, batch: &mut [*mut u8]) -> usize {
            self.remove_calls.fetch_add(1, Ordering::Relaxed);
            let mut pool = self.pool.lock();
            let n = batch.len().min(pool.len());
            for slot in batch[..n].iter_mut() {
                *slot = pool.pop().unwrap();
            }
            n
        }

        fn size_class(&self) -> usize {
            self.size_class
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn obj(i: usize) -> *mut u8 {
            (0x1000 + i * 8) as *mut u8
        }

        #[test]
        fn test_mock_round_trip() {
            let fl = MockFreeList::new(3);
            assert_eq!(fl.size_class(), 3);

            fl.insert_range(&[obj(0), obj(1), obj(2)]);
            assert_eq!(fl.len(), 3);

            let mut batch = [core::ptr::null_mut(); 2];
            assert_eq!(fl.remove_range(&mut batch), 2);
            // LIFO: most recently inserted first.
            assert_eq!(batch, [obj(2), obj(1)]);
            assert_eq!(fl.len(), 1);
        }

        #[test]
        fn test_mock_partial_remove() {
            let fl = MockFreeList::new(1);
            fl.insert_range(&[obj(7)]);

            let mut batch = [core::ptr::null_mut(); 4];
            assert_eq!(fl.remove_range(&mut batch), 1);
            assert_eq!(batch[0], obj(7));
            // Drained: a further remove supplies nothing.
            assert_eq!(fl.remove_range(&mut batch), 0);
        }
    }
}
