//! Tier Manager
//!
//! Composes up to three backends, fast (built-in sharded store), local and
//! remote, with read-through promotion and write-through fan-out.
//!
//! Reads walk the enabled tiers fastest first and return the first live
//! value. A hit below the fast tier schedules a tracked background copy into
//! every enabled faster tier; the read never waits for it. Writes and deletes
//! go to every enabled tier; a failing tier is logged and counted but never
//! rolls back the others.
//!
//! Writes and deletes hold a write fence for their key. A promotion is
//! dropped, or retracted after the fact, when a write to its key started
//! after the lookup began, so it never resurrects an overwritten or deleted
//! value.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::backend::CacheBackend;
use super::fence::{WriteFences, WriteMark};
use super::memory::InMemoryBackend;
use super::metrics::{LatencyTracker, TierMetrics, TieredStats};
use crate::cache::{CacheStore, StoreConfig};
use crate::config::duration_str;
use crate::error::{Error, Result};

/// Cache tier, ordered fastest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// In-process sharded store (hot)
    Fast,
    /// Local persistent adapter (warm)
    Local,
    /// Remote distributed adapter (cold)
    Remote,
}

impl CacheTier {
    pub const ALL: [CacheTier; 3] = [CacheTier::Fast, CacheTier::Local, CacheTier::Remote];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CacheTier::Fast => "fast",
            CacheTier::Local => "local",
            CacheTier::Remote => "remote",
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Per-tier settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierSettings {
    pub enabled: bool,
    /// TTL for values written to this tier (zero = backend default)
    #[serde(with = "duration_str")]
    pub ttl: Duration,
}

impl TierSettings {
    pub fn new(enabled: bool, ttl: Duration) -> Self {
        Self { enabled, ttl }
    }

    pub fn disabled() -> Self {
        Self::new(false, Duration::ZERO)
    }
}

/// Tier manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieredConfig {
    pub fast: TierSettings,
    pub local: TierSettings,
    pub remote: TierSettings,
    /// Store backing the fast tier
    pub store: StoreConfig,
    /// Copy values found in slower tiers into faster ones
    pub auto_promote: bool,
    /// Periodically drop idle entries from the fast tier
    pub auto_evict_cold: bool,
    /// Idle time after which a fast-tier entry counts as cold
    #[serde(with = "duration_str")]
    pub cold_after: Duration,
    #[serde(with = "duration_str")]
    pub maintenance_interval: Duration,
    /// Maximum keys warmed per `prefetch` call (0 disables prefetching)
    pub prefetch_size: usize,
}

impl Default for TieredConfig {
    fn default() -> Self {
        Self {
            fast: TierSettings::new(true, Duration::from_secs(300)),
            local: TierSettings::new(true, Duration::from_secs(3600)),
            remote: TierSettings::new(true, Duration::from_secs(86400)),
            store: StoreConfig::default(),
            auto_promote: true,
            auto_evict_cold: true,
            cold_after: Duration::from_secs(1800),
            maintenance_interval: Duration::from_secs(60),
            prefetch_size: 0,
        }
    }
}

impl TieredConfig {
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        if self.auto_evict_cold {
            if self.maintenance_interval.is_zero() {
                return Err(Error::InvalidConfig(
                    "maintenance_interval must be > 0 when auto_evict_cold is set".into(),
                ));
            }
            if self.cold_after.is_zero() {
                return Err(Error::InvalidConfig(
                    "cold_after must be > 0 when auto_evict_cold is set".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn settings(&self, tier: CacheTier) -> &TierSettings {
        match tier {
            CacheTier::Fast => &self.fast,
            CacheTier::Local => &self.local,
            CacheTier::Remote => &self.remote,
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Cache lookup result
#[derive(Debug, Clone)]
pub struct CacheLookup<V> {
    pub value: V,
    /// Tier that answered
    pub tier: CacheTier,
    /// Lookup latency across all tiers consulted
    pub latency: Duration,
}

struct TierSlot<V> {
    tier: CacheTier,
    backend: Arc<dyn CacheBackend<V>>,
    settings: TierSettings,
}

struct ManagerInner<V> {
    /// Attached tiers, ordered fastest first
    slots: Vec<TierSlot<V>>,
    fast: Arc<CacheStore<V>>,
    config: TieredConfig,
    metrics: TierMetrics,
    fences: WriteFences,
    promotions: TaskTracker,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl<V> ManagerInner<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn active(&self) -> impl Iterator<Item = (usize, &TierSlot<V>)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.settings.enabled)
    }

    /// Copy a value found at slot `from` into every enabled faster tier.
    /// `seen` is the key's write mark from before the value was read; each
    /// copy is skipped or retracted once a write to the key has started.
    async fn promote(&self, key: &str, value: V, from: usize, seen: WriteMark) -> usize {
        let Some(source) = self.slots.get(from) else {
            return 0;
        };
        let tags = source.backend.tags(key).await.unwrap_or_else(|e| {
            debug!("Could not read tags of {} from {} tier: {}", key, source.tier, e);
            Vec::new()
        });
        let tag_refs: Vec<&str> = tags.iter().map(String::as_str).collect();

        let mut promoted = 0;
        for (_, slot) in self.active().filter(|(index, _)| *index < from) {
            if !self.fences.unchanged(key, seen) {
                debug!("Dropped promotion of {}, written since it was read", key);
                break;
            }
            match slot
                .backend
                .set(key, value.clone(), slot.settings.ttl, &tag_refs)
                .await
            {
                Ok(()) if !self.fences.unchanged(key, seen) => {
                    // A write raced the copy; a miss is safe, a stale hit is not
                    if let Err(e) = slot.backend.delete(key).await {
                        warn!("Retracting promotion of {} from {} tier failed: {}", key, slot.tier, e);
                    }
                    debug!("Retracted promotion of {} into {} tier", key, slot.tier);
                    break;
                }
                Ok(()) => {
                    self.metrics.record_promotion(slot.tier);
                    promoted += 1;
                    debug!("Promoted {} from {} to {} tier", key, source.tier, slot.tier);
                }
                Err(e) => {
                    self.metrics.record_promotion_failure();
                    warn!("Promotion of {} into {} tier failed: {}", key, slot.tier, e);
                }
            }
        }
        promoted
    }

    async fn evict_cold(&self) -> usize {
        let Some((_, slot)) = self.active().find(|(_, slot)| slot.tier == CacheTier::Fast) else {
            return 0;
        };
        match slot.backend.evict_idle(self.config.cold_after).await {
            Ok(evicted) => {
                if evicted > 0 {
                    self.metrics.record_cold_evictions(evicted);
                    debug!("Evicted {} cold entries from the fast tier", evicted);
                }
                evicted
            }
            Err(e) => {
                error!("Cold eviction failed: {}", e);
                0
            }
        }
    }
}

/// Tiered cache manager
pub struct CacheManager<V> {
    inner: Arc<ManagerInner<V>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl<V> CacheManager<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a manager with only the built-in fast tier
    pub fn new(config: TieredConfig) -> Result<Self> {
        Self::with_backends(config, None, None)
    }

    /// Create a manager with optional local and remote adapters
    pub fn with_backends(
        config: TieredConfig,
        local: Option<Arc<dyn CacheBackend<V>>>,
        remote: Option<Arc<dyn CacheBackend<V>>>,
    ) -> Result<Self> {
        config.validate()?;

        let fast = Arc::new(CacheStore::new(config.store.clone())?);
        let mut slots = vec![TierSlot {
            tier: CacheTier::Fast,
            backend: Arc::clone(&fast) as Arc<dyn CacheBackend<V>>,
            settings: config.fast.clone(),
        }];
        for (tier, backend) in [(CacheTier::Local, local), (CacheTier::Remote, remote)] {
            if let Some(backend) = backend {
                slots.push(TierSlot {
                    tier,
                    backend,
                    settings: config.settings(tier).clone(),
                });
            }
        }

        let active: Vec<String> = slots
            .iter()
            .filter(|slot| slot.settings.enabled)
            .map(|slot| format!("{}={}", slot.tier, slot.backend.name()))
            .collect();
        info!(
            "Created tiered cache (tiers=[{}], auto_promote={}, auto_evict_cold={})",
            active.join(", "),
            config.auto_promote,
            config.auto_evict_cold
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                slots,
                fast,
                config,
                metrics: TierMetrics::new(),
                fences: WriteFences::default(),
                promotions: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
            maintenance: Mutex::new(None),
        })
    }

    /// Create with an in-memory remote tier
    pub fn in_memory(config: TieredConfig) -> Result<Self> {
        let remote = InMemoryBackend::new("in-memory").with_default_ttl(config.remote.ttl);
        Self::with_backends(config, None, Some(Arc::new(remote)))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    pub fn config(&self) -> &TieredConfig {
        &self.inner.config
    }

    /// The built-in store backing the fast tier
    pub fn fast(&self) -> &Arc<CacheStore<V>> {
        &self.inner.fast
    }

    /// Backend attached at `tier`, enabled or not
    pub fn tier(&self, tier: CacheTier) -> Option<&Arc<dyn CacheBackend<V>>> {
        self.inner
            .slots
            .iter()
            .find(|slot| slot.tier == tier)
            .map(|slot| &slot.backend)
    }

    /// Start the fast tier's sweeper and, with `auto_evict_cold`, the
    /// maintenance loop.
    pub fn start(&self) -> Result<()> {
        self.ensure_open()?;
        self.inner.fast.start()?;

        if self.inner.config.auto_evict_cold {
            let mut maintenance = self.maintenance.lock();
            if maintenance.is_none() {
                let runtime = tokio::runtime::Handle::try_current()
                    .map_err(|_| Error::NoRuntime("tier maintenance"))?;
                *maintenance = Some(runtime.spawn(run_maintenance(Arc::clone(&self.inner))));
            }
        }
        Ok(())
    }

    /// Look up a key, fastest tier first
    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Option<CacheLookup<V>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return None;
        }
        let start = LatencyTracker::start();
        self.inner.metrics.record_lookup();
        // Taken before any tier is read; None while a write is in flight
        let mark = self.inner.fences.mark(key);

        for (index, slot) in self.inner.active() {
            let tracker = LatencyTracker::start();
            match slot.backend.get(key).await {
                Ok(Some(value)) => {
                    self.inner.metrics.record_hit(slot.tier);
                    self.inner
                        .metrics
                        .record_read_latency(slot.tier, tracker.elapsed());

                    if index > 0 && self.inner.config.auto_promote {
                        match mark {
                            Some(mark) => self.schedule_promotion(key, value.clone(), index, mark),
                            None => debug!("Skipped promotion of {}, write in flight", key),
                        }
                    }

                    return Some(CacheLookup {
                        value,
                        tier: slot.tier,
                        latency: start.elapsed(),
                    });
                }
                Ok(None) => self.inner.metrics.record_miss(slot.tier),
                Err(e) => {
                    self.inner.metrics.record_error(slot.tier);
                    self.inner.metrics.record_miss(slot.tier);
                    warn!("Read of {} from {} tier failed: {}", key, slot.tier, e);
                }
            }
        }

        self.inner.metrics.record_full_miss();
        None
    }

    /// Look up a value, discarding tier details
    pub async fn get_value(&self, key: &str) -> Option<V> {
        self.get(key).await.map(|lookup| lookup.value)
    }

    fn schedule_promotion(&self, key: &str, value: V, from: usize, seen: WriteMark) {
        let inner = Arc::clone(&self.inner);
        let key = key.to_owned();
        self.inner.promotions.spawn(async move {
            tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => {}
                _ = inner.promote(&key, value, from, seen) => {}
            }
        });
    }

    /// Write a value to every enabled tier using each tier's TTL
    pub async fn set(&self, key: &str, value: V) -> Result<()> {
        self.set_with_tags(key, value, &[]).await
    }

    /// Write a tagged value to every enabled tier. Fails only when every
    /// enabled tier rejected the write.
    #[instrument(skip(self, value))]
    pub async fn set_with_tags(&self, key: &str, value: V, tags: &[&str]) -> Result<()> {
        self.ensure_open()?;
        let _fence = self.inner.fences.fence(key);

        let writes = self.inner.active().map(|(_, slot)| {
            let value = value.clone();
            async move {
                let tracker = LatencyTracker::start();
                let result = slot
                    .backend
                    .set(key, value, slot.settings.ttl, tags)
                    .await;
                (slot.tier, tracker.elapsed(), result)
            }
        });
        let results = join_all(writes).await;

        let attempted = results.len();
        let mut failed = 0;
        let mut last_error = None;
        for (tier, elapsed, result) in results {
            match result {
                Ok(()) => self.inner.metrics.record_write_latency(tier, elapsed),
                Err(e) => {
                    failed += 1;
                    self.inner.metrics.record_write_failure(tier);
                    warn!("Write of {} to {} tier failed: {}", key, tier, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if failed == attempted => Err(Error::backend("all tiers", e)),
            _ => Ok(()),
        }
    }

    /// Remove a key from every enabled tier. Returns whether any tier held it.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        let _fence = self.inner.fences.fence(key);

        let deletes = self
            .inner
            .active()
            .map(|(_, slot)| async move { (slot.tier, slot.backend.delete(key).await) });

        let mut deleted = false;
        for (tier, result) in join_all(deletes).await {
            match result {
                Ok(existed) => deleted |= existed,
                Err(e) => warn!("Delete of {} from {} tier failed: {}", key, tier, e),
            }
        }
        Ok(deleted)
    }

    /// Invalidate tagged entries in every enabled tier. Returns the largest
    /// per-tier removal count.
    #[instrument(skip(self))]
    pub async fn delete_by_tags(&self, tags: &[&str]) -> Result<usize> {
        self.ensure_open()?;
        let _fence = self.inner.fences.fence_all();

        let deletes = self
            .inner
            .active()
            .map(|(_, slot)| async move { (slot.tier, slot.backend.delete_by_tags(tags).await) });

        let mut removed = 0;
        for (tier, result) in join_all(deletes).await {
            match result {
                Ok(count) => removed = removed.max(count),
                Err(e) => warn!("Tag invalidation on {} tier failed: {}", tier, e),
            }
        }
        Ok(removed)
    }

    /// Check every enabled tier for a live value
    pub async fn has(&self, key: &str) -> bool {
        if self.inner.closed.load(Ordering::Acquire) {
            return false;
        }
        for (_, slot) in self.inner.active() {
            match slot.backend.has(key).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => debug!("Existence check on {} tier failed: {}", slot.tier, e),
            }
        }
        false
    }

    /// Warm the fast tier with up to `prefetch_size` of `keys` found in
    /// slower tiers. Returns the number of keys copied.
    pub async fn prefetch(&self, keys: &[&str]) -> Result<usize> {
        self.ensure_open()?;
        let limit = self.inner.config.prefetch_size;
        if limit == 0 || !self.inner.config.fast.enabled {
            return Ok(0);
        }

        let mut warmed = 0;
        for key in keys.iter().take(limit) {
            if self.inner.fast.has(key) {
                continue;
            }
            let Some(mark) = self.inner.fences.mark(key) else {
                continue;
            };
            for (index, slot) in self.inner.active().filter(|(index, _)| *index > 0) {
                if let Ok(Some(value)) = slot.backend.get(key).await {
                    if self.inner.promote(key, value, index, mark).await > 0 {
                        warmed += 1;
                    }
                    break;
                }
            }
        }
        Ok(warmed)
    }

    /// Drop idle entries from the fast tier now
    pub async fn evict_cold(&self) -> usize {
        self.inner.evict_cold().await
    }

    /// Wait for in-flight promotions to finish
    pub async fn settle(&self) {
        self.inner.promotions.close();
        self.inner.promotions.wait().await;
        self.inner.promotions.reopen();
    }

    pub fn stats(&self) -> TieredStats {
        let mut enabled = [false; 3];
        for (_, slot) in self.inner.active() {
            enabled[slot.tier.index()] = true;
        }
        self.inner
            .metrics
            .snapshot(enabled, Some(self.inner.fast.stats()))
    }

    /// Stop background work, wait for promotions and close every tier.
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.inner.shutdown.cancel();
        let maintenance = self.maintenance.lock().take();
        if let Some(handle) = maintenance {
            if let Err(e) = handle.await {
                error!("Tier maintenance terminated abnormally: {}", e);
            }
        }

        self.inner.promotions.close();
        self.inner.promotions.wait().await;

        for slot in &self.inner.slots {
            if let Err(e) = slot.backend.close().await {
                warn!("Closing {} tier failed: {}", slot.tier, e);
            }
        }

        info!("Tiered cache closed");
        Ok(())
    }
}

impl<V> Drop for CacheManager<V> {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn run_maintenance<V>(inner: Arc<ManagerInner<V>>)
where
    V: Clone + Send + Sync + 'static,
{
    let period = inner.config.maintenance_interval;
    info!(
        "Starting tier maintenance (interval={:?}, cold_after={:?})",
        period, inner.config.cold_after
    );

    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = inner.shutdown.cancelled() => {
                info!("Tier maintenance shutting down");
                break;
            }

            _ = tick.tick() => {
                inner.evict_cold().await;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
