//! Prometheus Exporter
//!
//! Publishes store and tier statistics into a private registry. Values are
//! copied from stats snapshots, so every series is a gauge.

use prometheus::{Encoder, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::StoreStats;
use crate::error::Result;
use crate::tier::TieredStats;

/// Registry-backed exporter for cache statistics
#[derive(Clone)]
pub struct CacheExporter {
    registry: Registry,
    store_ops: IntGaugeVec,
    store_entries: IntGaugeVec,
    shard_entries: IntGaugeVec,
    tier_ops: IntGaugeVec,
    tier_hit_ratio: GaugeVec,
    tier_latency: GaugeVec,
    lookups: IntGauge,
    promotion_failures: IntGauge,
    cold_evictions: IntGauge,
}

impl CacheExporter {
    /// Create an exporter whose series are prefixed with `namespace`
    pub fn new(namespace: &str) -> Result<Self> {
        let registry = Registry::new();

        let store_ops = IntGaugeVec::new(
            Opts::new("store_operations", "Store operation counters by kind").namespace(namespace),
            &["store", "kind"],
        )?;
        let store_entries = IntGaugeVec::new(
            Opts::new("store_entries", "Live entries held by a store").namespace(namespace),
            &["store"],
        )?;
        let shard_entries = IntGaugeVec::new(
            Opts::new("shard_entries", "Live entries held by one shard").namespace(namespace),
            &["store", "shard"],
        )?;
        let tier_ops = IntGaugeVec::new(
            Opts::new("tier_operations", "Tier operation counters by kind").namespace(namespace),
            &["tier", "kind"],
        )?;
        let tier_hit_ratio = GaugeVec::new(
            Opts::new("tier_hit_ratio", "Hit ratio of one tier").namespace(namespace),
            &["tier"],
        )?;
        let tier_latency = GaugeVec::new(
            Opts::new(
                "tier_latency_seconds",
                "Smoothed operation latency of one tier",
            )
            .namespace(namespace),
            &["tier", "op"],
        )?;
        let lookups = IntGauge::with_opts(
            Opts::new("lookups", "Tiered lookups performed").namespace(namespace),
        )?;
        let promotion_failures = IntGauge::with_opts(
            Opts::new("promotion_failures", "Failed promotions into faster tiers")
                .namespace(namespace),
        )?;
        let cold_evictions = IntGauge::with_opts(
            Opts::new("cold_evictions", "Idle entries dropped from the fast tier")
                .namespace(namespace),
        )?;

        registry.register(Box::new(store_ops.clone()))?;
        registry.register(Box::new(store_entries.clone()))?;
        registry.register(Box::new(shard_entries.clone()))?;
        registry.register(Box::new(tier_ops.clone()))?;
        registry.register(Box::new(tier_hit_ratio.clone()))?;
        registry.register(Box::new(tier_latency.clone()))?;
        registry.register(Box::new(lookups.clone()))?;
        registry.register(Box::new(promotion_failures.clone()))?;
        registry.register(Box::new(cold_evictions.clone()))?;

        Ok(Self {
            registry,
            store_ops,
            store_entries,
            shard_entries,
            tier_ops,
            tier_hit_ratio,
            tier_latency,
            lookups,
            promotion_failures,
            cold_evictions,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Publish a store snapshot under the `store` label
    pub fn observe_store(&self, store: &str, stats: &StoreStats) {
        for (kind, value) in [
            ("hits", stats.hits),
            ("misses", stats.misses),
            ("evictions", stats.evictions),
            ("expirations", stats.expirations),
        ] {
            self.store_ops
                .with_label_values(&[store, kind])
                .set(value as i64);
        }
        self.store_entries
            .with_label_values(&[store])
            .set(stats.size as i64);

        for shard in &stats.shards {
            let index = shard.index.to_string();
            self.shard_entries
                .with_label_values(&[store, index.as_str()])
                .set(shard.entries as i64);
        }
    }

    /// Publish a tier manager snapshot, including its fast store
    pub fn observe_tiers(&self, stats: &TieredStats) {
        for tier in &stats.tiers {
            let label = tier.tier.as_str();
            for (kind, value) in [
                ("hits", tier.hits),
                ("misses", tier.misses),
                ("errors", tier.errors),
                ("write_failures", tier.write_failures),
                ("promotions", tier.promotions),
            ] {
                self.tier_ops
                    .with_label_values(&[label, kind])
                    .set(value as i64);
            }
            self.tier_hit_ratio
                .with_label_values(&[label])
                .set(tier.hit_ratio);
            self.tier_latency
                .with_label_values(&[label, "read"])
                .set(tier.read_latency_us as f64 / 1_000_000.0);
            self.tier_latency
                .with_label_values(&[label, "write"])
                .set(tier.write_latency_us as f64 / 1_000_000.0);
        }

        self.lookups.set(stats.lookups as i64);
        self.promotion_failures.set(stats.promotion_failures as i64);
        self.cold_evictions.set(stats.cold_evictions as i64);

        if let Some(fast) = &stats.fast {
            self.observe_store("fast", fast);
        }
    }

    /// Render the registry in the Prometheus text format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Content type for rendered output
    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }
}
