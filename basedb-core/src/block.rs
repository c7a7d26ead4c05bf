//! Block addressing.
//!
//! Node ids start at 1. A type's id space is cut into blocks of
//! `block_capacity` ids:
//!
//! ```text
//! cap = 3:   [1 2 3] [4 5 6] [7 8 9] ...
//! key  = type_id * 2^32 + start
//! ```

use crate::value::NodeId;

/// First id of the block holding `id`.
#[inline]
pub fn block_start(id: NodeId, capacity: u32) -> u32 {
    debug_assert!(capacity > 0);
    (id.max(1) - 1) / capacity * capacity + 1
}

/// Last id of the block starting at `start`.
#[inline]
pub fn block_end(start: u32, capacity: u32) -> u32 {
    start.saturating_add(capacity - 1)
}

#[inline]
pub fn block_key(type_id: u16, start: u32) -> u64 {
    ((type_id as u64) << 32) | start as u64
}

#[inline]
pub fn block_key_for(type_id: u16, capacity: u32, id: NodeId) -> u64 {
    block_key(type_id, block_start(id, capacity))
}

/// Inverse of [`block_key`]: `(type_id, start)`.
#[inline]
pub fn split_key(key: u64) -> (u16, u32) {
    ((key >> 32) as u16, key as u32)
}

/// Dump file name of a block.
pub fn dump_file_name(type_id: u16, start: u32, end: u32) -> String {
    format!("{}_{}_{}.sdb", type_id, start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_block_boundaries() {
        assert_eq!(block_start(1, 3), 1);
        assert_eq!(block_start(3, 3), 1);
        assert_eq!(block_start(4, 3), 4);
        assert_eq!(block_end(4, 3), 6);
        assert_eq!(block_start(100_000, 100_000), 1);
        assert_eq!(block_start(100_001, 100_000), 100_001);
        assert_eq!(split_key(block_key(7, 100_001)), (7, 100_001));
        assert_eq!(block_key(1, 1), 4_294_967_297);
        assert_eq!(dump_file_name(2, 1, 100_000), "2_1_100000.sdb");
    }

    proptest! {
        #[test]
        fn prop_same_block_iff_same_bucket(n in 1u32..10_000_000, m in 1u32..10_000_000, cap in 1u32..200_000) {
            let same = block_start(n, cap) == block_start(m, cap);
            prop_assert_eq!(same, (n - 1) / cap == (m - 1) / cap);
        }

        #[test]
        fn prop_start_is_stable_and_contains_id(n in 1u32..u32::MAX, cap in 1u32..1_000_000) {
            let start = block_start(n, cap);
            prop_assert_eq!(block_start(start, cap), start);
            prop_assert!(start <= n && n <= block_end(start, cap));
        }
    }
}
