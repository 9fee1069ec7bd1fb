//! Cache Statistics
//!
//! Lock-free counters kept per shard and mirrored store-wide. Snapshots sum
//! independently updated atomics, so they are eventually consistent.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Hit/miss/eviction/expiration counters plus the live entry count
#[derive(Debug, Default)]
pub(crate) struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    size: AtomicU64,
}

impl Counters {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_size(&self) {
        self.size.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_size(&self) {
        self.size.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn sub_size(&self, n: u64) {
        self.size.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Zero every counter
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.expirations.store(0, Ordering::Relaxed);
        self.size.store(0, Ordering::Relaxed);
    }
}

fn ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Snapshot of one shard
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardStats {
    pub index: usize,
    pub entries: u64,
    pub tags: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// Snapshot of a whole store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    /// Live entry count (entries held, including expired ones not yet reclaimed)
    pub size: u64,
    pub shards: Vec<ShardStats>,
}

impl StoreStats {
    /// Hit ratio (0.0 - 1.0)
    pub fn hit_ratio(&self) -> f64 {
        ratio(self.hits, self.misses)
    }
}

impl ShardStats {
    /// Hit ratio (0.0 - 1.0)
    pub fn hit_ratio(&self) -> f64 {
        ratio(self.hits, self.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let counters = Counters::default();
        counters.record_hit();
        counters.record_hit();
        counters.record_miss();
        counters.inc_size();
        counters.inc_size();
        counters.dec_size();

        assert_eq!(counters.hits(), 2);
        assert_eq!(counters.misses(), 1);
        assert_eq!(counters.size(), 1);

        counters.reset();
        assert_eq!(counters.hits(), 0);
        assert_eq!(counters.size(), 0);
    }

    #[test]
    fn test_hit_ratio() {
        let stats = StoreStats {
            hits: 3,
            misses: 1,
            evictions: 0,
            expirations: 0,
            size: 0,
            shards: vec![],
        };
        assert!((stats.hit_ratio() - 0.75).abs() < f64::EPSILON);

        let empty = StoreStats { hits: 0, misses: 0, ..stats };
        assert_eq!(empty.hit_ratio(), 0.0);
    }
}
