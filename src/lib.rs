#![no_std]

//! xfercache: per-size-class transfer caches for a segregated-size-class
//! allocator.
//!
//! Sits between per-thread/per-CPU allocation fast paths and the central
//! free lists, buffering recently freed objects in fixed-size batches so
//! the common free-then-allocate cycle touches one spinlock and a couple
//! of memcpys instead of the central list's heavier bookkeeping:
//! - [`TransferCache`]: one LIFO batch cache per size class
//! - [`TransferCacheManager`]: the per-class array plus the periodic
//!   capacity-rebalancing pass
//! - [`ShardedTransferCacheManager`]: optional per-L3-domain sharding
//!   layered in front of the unsharded manager
//!
//! The central free list itself is external; callers supply it through
//! the [`FreeList`] trait.
//!
//! # Usage
//!
//! ```ignore
//! let manager = TransferCacheManager::new(ManagerOptions::default(), |cls| {
//!     CentralList::new(cls)
//! });
//! let mut batch = [core::ptr::null_mut(); 32];
//! let got = manager.remove_range(size_class, &mut batch[..n]);
//! ```

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod config;
pub mod freelist;
pub mod manager;
pub mod sharded;
pub mod size_class;
pub mod stats;
pub mod sync;
pub mod transfer_cache;

pub use freelist::FreeList;
pub use manager::{ManagerOptions, TransferCacheManager};
pub use sharded::{CpuLayout, ProdCpuLayout, ShardedMode, ShardedOptions, ShardedTransferCacheManager};
pub use stats::TransferCacheStats;
pub use transfer_cache::TransferCache;
