//! Tier Metrics Collection
//!
//! Per-tier hit/miss/latency counters for the tier manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::manager::CacheTier;
use crate::cache::StoreStats;

/// EMA smoothing factor for latencies
const LATENCY_ALPHA: f64 = 0.1;

#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    write_failures: AtomicU64,
    /// Values copied into this tier from a slower one
    promotions: AtomicU64,
    /// Microseconds, exponential moving average
    read_latency_us: AtomicU64,
    write_latency_us: AtomicU64,
}

/// Tier metrics collector
#[derive(Debug, Default)]
pub struct TierMetrics {
    tiers: [TierCounters; 3],
    lookups: AtomicU64,
    /// Lookups that missed every tier
    full_misses: AtomicU64,
    promotion_failures: AtomicU64,
    cold_evictions: AtomicU64,
}

impl TierMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn tier(&self, tier: CacheTier) -> &TierCounters {
        &self.tiers[tier.index()]
    }

    pub fn record_lookup(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_full_miss(&self) {
        self.full_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self, tier: CacheTier) {
        self.tier(tier).hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self, tier: CacheTier) {
        self.tier(tier).misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, tier: CacheTier) {
        self.tier(tier).errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self, tier: CacheTier) {
        self.tier(tier).write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self, into: CacheTier) {
        self.tier(into).promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion_failure(&self) {
        self.promotion_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cold_evictions(&self, count: usize) {
        self.cold_evictions
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_read_latency(&self, tier: CacheTier, duration: Duration) {
        update_latency_ema(&self.tier(tier).read_latency_us, duration);
    }

    pub fn record_write_latency(&self, tier: CacheTier, duration: Duration) {
        update_latency_ema(&self.tier(tier).write_latency_us, duration);
    }

    pub fn hits(&self, tier: CacheTier) -> u64 {
        self.tier(tier).hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self, tier: CacheTier) -> u64 {
        self.tier(tier).misses.load(Ordering::Relaxed)
    }

    pub fn promotions(&self, into: CacheTier) -> u64 {
        self.tier(into).promotions.load(Ordering::Relaxed)
    }

    pub fn read_latency(&self, tier: CacheTier) -> Duration {
        Duration::from_micros(self.tier(tier).read_latency_us.load(Ordering::Relaxed))
    }

    pub fn write_latency(&self, tier: CacheTier) -> Duration {
        Duration::from_micros(self.tier(tier).write_latency_us.load(Ordering::Relaxed))
    }

    /// Fraction of lookups answered by any tier
    pub fn overall_hit_ratio(&self) -> f64 {
        let lookups = self.lookups.load(Ordering::Relaxed);
        if lookups == 0 {
            return 0.0;
        }
        let misses = self.full_misses.load(Ordering::Relaxed).min(lookups);
        (lookups - misses) as f64 / lookups as f64
    }

    /// Snapshot for the given tiers; `enabled` marks which are active
    pub fn snapshot(&self, enabled: [bool; 3], fast: Option<StoreStats>) -> TieredStats {
        let tiers = CacheTier::ALL
            .iter()
            .map(|&tier| {
                let counters = self.tier(tier);
                let hits = counters.hits.load(Ordering::Relaxed);
                let misses = counters.misses.load(Ordering::Relaxed);
                TierStats {
                    tier,
                    enabled: enabled[tier.index()],
                    hits,
                    misses,
                    errors: counters.errors.load(Ordering::Relaxed),
                    write_failures: counters.write_failures.load(Ordering::Relaxed),
                    promotions: counters.promotions.load(Ordering::Relaxed),
                    hit_ratio: if hits + misses == 0 {
                        0.0
                    } else {
                        hits as f64 / (hits + misses) as f64
                    },
                    read_latency_us: counters.read_latency_us.load(Ordering::Relaxed),
                    write_latency_us: counters.write_latency_us.load(Ordering::Relaxed),
                }
            })
            .collect();

        TieredStats {
            tiers,
            lookups: self.lookups.load(Ordering::Relaxed),
            full_misses: self.full_misses.load(Ordering::Relaxed),
            overall_hit_ratio: self.overall_hit_ratio(),
            promotion_failures: self.promotion_failures.load(Ordering::Relaxed),
            cold_evictions: self.cold_evictions.load(Ordering::Relaxed),
            fast,
        }
    }
}

fn update_latency_ema(target: &AtomicU64, duration: Duration) {
    let new_us = duration.as_micros() as u64;

    loop {
        let current = target.load(Ordering::Relaxed);
        let updated = if current == 0 {
            new_us
        } else {
            ((1.0 - LATENCY_ALPHA) * current as f64 + LATENCY_ALPHA * new_us as f64) as u64
        };

        if target
            .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
}

/// Snapshot of one tier
#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub tier: CacheTier,
    pub enabled: bool,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub write_failures: u64,
    pub promotions: u64,
    pub hit_ratio: f64,
    pub read_latency_us: u64,
    pub write_latency_us: u64,
}

/// Snapshot of the whole tier manager
#[derive(Debug, Clone, Serialize)]
pub struct TieredStats {
    pub tiers: Vec<TierStats>,
    pub lookups: u64,
    pub full_misses: u64,
    pub overall_hit_ratio: f64,
    pub promotion_failures: u64,
    pub cold_evictions: u64,
    /// Store statistics of the built-in fast tier
    pub fast: Option<StoreStats>,
}

impl TieredStats {
    pub fn tier(&self, tier: CacheTier) -> Option<&TierStats> {
        self.tiers.iter().find(|stats| stats.tier == tier)
    }

    /// Promotions into every tier
    pub fn promotions(&self) -> u64 {
        self.tiers.iter().map(|stats| stats.promotions).sum()
    }
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_tracking() {
        let metrics = TierMetrics::new();
        metrics.record_hit(CacheTier::Fast);
        metrics.record_hit(CacheTier::Fast);
        metrics.record_miss(CacheTier::Fast);
        metrics.record_hit(CacheTier::Remote);

        assert_eq!(metrics.hits(CacheTier::Fast), 2);
        assert_eq!(metrics.misses(CacheTier::Fast), 1);
        assert_eq!(metrics.hits(CacheTier::Remote), 1);
        assert_eq!(metrics.hits(CacheTier::Local), 0);

        let snapshot = metrics.snapshot([true, false, true], None);
        let fast = snapshot.tier(CacheTier::Fast).unwrap();
        assert!((fast.hit_ratio - 0.666).abs() < 0.01);
        assert!(!snapshot.tier(CacheTier::Local).unwrap().enabled);
    }

    #[test]
    fn test_latency_tracking() {
        let metrics = TierMetrics::new();

        metrics.record_read_latency(CacheTier::Fast, Duration::from_micros(100));
        assert_eq!(metrics.read_latency(CacheTier::Fast), Duration::from_micros(100));

        // EMA should smooth values
        metrics.record_read_latency(CacheTier::Fast, Duration::from_micros(200));
        let latency = metrics.read_latency(CacheTier::Fast).as_micros();
        assert!(latency > 100 && latency < 200);
        assert_eq!(metrics.write_latency(CacheTier::Fast), Duration::ZERO);
    }

    #[test]
    fn test_overall_hit_ratio() {
        let metrics = TierMetrics::new();
        assert_eq!(metrics.overall_hit_ratio(), 0.0);

        for _ in 0..4 {
            metrics.record_lookup();
        }
        metrics.record_full_miss();
        assert!((metrics.overall_hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_promotion_tracking() {
        let metrics = TierMetrics::new();
        metrics.record_promotion(CacheTier::Fast);
        metrics.record_promotion(CacheTier::Local);
        metrics.record_promotion_failure();
        metrics.record_cold_evictions(3);

        let snapshot = metrics.snapshot([true; 3], None);
        assert_eq!(snapshot.promotions(), 2);
        assert_eq!(snapshot.promotion_failures, 1);
        assert_eq!(snapshot.cold_evictions, 3);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = TierMetrics::new();
        let json = serde_json::to_value(metrics.snapshot([true, false, false], None)).unwrap();
        assert_eq!(json["tiers"][0]["tier"], "fast");
        assert_eq!(json["tiers"].as_array().unwrap().len(), 3);
    }
}
