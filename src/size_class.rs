//! Size class table consumed by the transfer caches.
//!
//! The table is generated by build.rs from `xfercache.toml`. Index 0 is a
//! sentinel (no cache); real classes run from 1.

/// Information about a single size class.
#[derive(Clone, Copy)]
pub struct SizeClassInfo {
    /// Object size for this class (bytes).
    pub size: usize,
    /// Number of objects moved per batch between caching tiers.
    pub batch_size: usize,
}

include!(concat!(env!("OUT_DIR"), "/size_class_gen.rs"));

/// Number of defined size classes, including the index-0 sentinel.
pub const NUM_SIZE_CLASSES: usize = SIZE_CLASSES.len();

/// Object size for a size class. 0 for the sentinel.
#[inline]
pub fn class_to_size(cls: usize) -> usize {
    SIZE_CLASSES[cls].size
}

/// Objects moved per batch for a size class. 0 for the sentinel.
#[inline]
pub fn batch_size(cls: usize) -> usize {
    SIZE_CLASSES[cls].batch_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_class_is_empty() {
        assert_eq!(class_to_size(0), 0);
        assert_eq!(batch_size(0), 0);
    }

    #[test]
    fn test_classes_monotonically_increasing() {
        for i in 2..NUM_SIZE_CLASSES {
            assert!(
                SIZE_CLASSES[i].size > SIZE_CLASSES[i - 1].size,
                "class {} size {} not greater than class {} size {}",
                i,
                SIZE_CLASSES[i].size,
                i - 1,
                SIZE_CLASSES[i - 1].size
            );
        }
    }

    #[test]
    fn test_all_sizes_8_aligned() {
        for cls in 1..NUM_SIZE_CLASSES {
            assert_eq!(
                SIZE_CLASSES[cls].size % 8,
                0,
                "class {} size {} not 8-aligned",
                cls,
                SIZE_CLASSES[cls].size
            );
        }
    }

    #[test]
    fn test_batch_sizes_at_least_two() {
        for cls in 1..NUM_SIZE_CLASSES {
            assert!(
                SIZE_CLASSES[cls].batch_size >= 2,
                "class {} batch_size {} below minimum",
                cls,
                SIZE_CLASSES[cls].batch_size
            );
        }
    }

    #[test]
    fn test_max_objects_to_move_covers_table() {
        let max = (1..NUM_SIZE_CLASSES)
            .map(batch_size)
            .max()
            .unwrap();
        assert_eq!(max, crate::config::MAX_OBJECTS_TO_MOVE);
    }
}
