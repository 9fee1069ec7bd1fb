//! Shard Router
//!
//! Maps a key to a shard with a 32-bit FNV-1a hash. The shard count is fixed
//! for the lifetime of a store, so the mapping is stable.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a hash
#[inline]
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Deterministic key -> shard index mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    shard_count: usize,
}

impl ShardRouter {
    /// Create a router over `shard_count` shards (clamped to at least one)
    pub fn new(shard_count: usize) -> Self {
        Self {
            shard_count: shard_count.max(1),
        }
    }

    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Shard index for a key
    #[inline]
    pub fn shard_for(&self, key: &str) -> usize {
        fnv1a_32(key.as_bytes()) as usize % self.shard_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fnv1a_reference_vectors() {
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn test_zero_shards_clamped() {
        let router = ShardRouter::new(0);
        assert_eq!(router.shard_count(), 1);
        assert_eq!(router.shard_for("anything"), 0);
    }

    #[test]
    fn test_distribution() {
        let router = ShardRouter::new(16);
        let mut counts = [0usize; 16];
        for i in 0..16_000 {
            counts[router.shard_for(&format!("user:{}", i))] += 1;
        }
        let max = *counts.iter().max().unwrap();
        let min = *counts.iter().min().unwrap();
        assert!(max < 1_500, "uneven distribution: max shard has {}", max);
        assert!(min > 500, "uneven distribution: min shard has {}", min);
    }

    proptest! {
        #[test]
        fn prop_routing_is_deterministic(key in ".{1,64}", shards in 1usize..256) {
            let router = ShardRouter::new(shards);
            let first = router.shard_for(&key);
            prop_assert!(first < shards);
            for _ in 0..4 {
                prop_assert_eq!(router.shard_for(&key), first);
            }
            // A second router with the same shard count agrees
            prop_assert_eq!(ShardRouter::new(shards).shard_for(&key), first);
        }
    }
}
