//! Cache Store
//!
//! Shard-partitioned key/value store. Every key is routed to exactly one
//! shard, which performs the operation under its own lock and updates both
//! its local counters and the store-wide aggregates.
//!
//! # Lifecycle
//!
//! `Created -> Running -> Stopped`. Operations work in `Created` and
//! `Running`; `start()` only adds the background sweeper. After `close()`
//! reads report nothing and mutations fail with [`Error::Closed`].

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::entry::compute_expiry;
use super::policy::{EvictionPolicy, EvictionStrategy};
use super::router::ShardRouter;
use super::shard::Shard;
use super::stats::{Counters, StoreStats};
use super::sweeper::{self, SweeperHandle};
use crate::config::{default_shard_count, duration_str};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Store configuration. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Number of independently locked shards
    pub shard_count: usize,
    /// Upper bound on live entries, split evenly across shards
    pub max_entries: usize,
    /// TTL applied when a write passes `Duration::ZERO` (zero = never expire)
    #[serde(with = "duration_str")]
    pub default_ttl: Duration,
    /// Interval between background sweeps
    #[serde(with = "duration_str")]
    pub sweep_interval: Duration,
    pub eviction_policy: EvictionPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            max_entries: 100_000,
            default_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

impl StoreConfig {
    /// Reject configurations the store cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(Error::InvalidConfig("shard_count must be > 0".into()));
        }
        if self.max_entries == 0 {
            return Err(Error::InvalidConfig("max_entries must be > 0".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::InvalidConfig("sweep_interval must be > 0".into()));
        }
        if self.max_entries < self.shard_count {
            warn!(
                "max_entries ({}) is below shard_count ({}); each shard still holds one entry",
                self.max_entries, self.shard_count
            );
        }
        Ok(())
    }

    /// Entries each shard holds before evicting
    pub fn shard_capacity(&self) -> usize {
        (self.max_entries / self.shard_count.max(1)).max(1)
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Store lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreState {
    /// Usable, no background sweeper
    Created,
    /// Usable, sweeper running
    Running,
    /// Closed; reads miss and writes fail
    Stopped,
}

impl StoreState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_CREATED => StoreState::Created,
            STATE_RUNNING => StoreState::Running,
            _ => StoreState::Stopped,
        }
    }
}

// =============================================================================
// Store
// =============================================================================

/// State shared with the sweeper task
pub(crate) struct StoreCore<V> {
    shards: Box<[Shard<V>]>,
    router: ShardRouter,
    counters: Counters,
}

impl<V> StoreCore<V> {
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard(&self, key: &str) -> &Shard<V> {
        &self.shards[self.router.shard_for(key)]
    }

    /// Remove expired entries from one shard
    pub fn sweep_shard(&self, index: usize) -> usize {
        self.shards
            .get(index)
            .map_or(0, |shard| shard.remove_expired(Instant::now(), &self.counters))
    }
}

/// Sharded concurrent cache store
pub struct CacheStore<V> {
    core: Arc<StoreCore<V>>,
    config: StoreConfig,
    strategy: Arc<dyn EvictionStrategy>,
    state: AtomicU8,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl<V> fmt::Debug for CacheStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("state", &self.state())
            .field("shards", &self.core.shard_count())
            .field("size", &self.core.counters.size())
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

impl<V> CacheStore<V> {
    /// Current lifecycle state
    pub fn state(&self) -> StoreState {
        StoreState::from_raw(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_STOPPED
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_stopped() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Name of the eviction strategy in use
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Shard index a key routes to
    pub fn shard_for(&self, key: &str) -> usize {
        self.core.router.shard_for(key)
    }

    /// Live entry count, approximate under concurrent writes
    pub fn size(&self) -> usize {
        self.core.counters.size() as usize
    }

    /// Counter snapshot. Shards are read one at a time, so this is not an
    /// atomic view of the whole store.
    pub fn stats(&self) -> StoreStats {
        let counters = &self.core.counters;
        StoreStats {
            hits: counters.hits(),
            misses: counters.misses(),
            evictions: counters.evictions(),
            expirations: counters.expirations(),
            size: counters.size(),
            shards: self.core.shards.iter().map(Shard::stats).collect(),
        }
    }

    pub(crate) fn core(&self) -> Arc<StoreCore<V>> {
        Arc::clone(&self.core)
    }
}

impl<V> CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Validate the configuration and allocate shards. The store is usable
    /// immediately; call [`start`](Self::start) to run the sweeper.
    pub fn new(config: StoreConfig) -> Result<Self> {
        let strategy = config.eviction_policy.strategy();
        Self::with_strategy(config, strategy)
    }

    /// Create a store with a custom eviction strategy
    pub fn with_strategy(config: StoreConfig, strategy: Arc<dyn EvictionStrategy>) -> Result<Self> {
        config.validate()?;

        let capacity = config.shard_capacity();
        let shards: Box<[Shard<V>]> = (0..config.shard_count)
            .map(|index| Shard::new(index, capacity))
            .collect();

        info!(
            "Created cache store ({} shards x {} entries, policy={}, default_ttl={:?})",
            config.shard_count,
            capacity,
            strategy.name(),
            config.default_ttl
        );

        Ok(Self {
            core: Arc::new(StoreCore {
                router: ShardRouter::new(config.shard_count),
                shards,
                counters: Counters::default(),
            }),
            config,
            strategy,
            state: AtomicU8::new(STATE_CREATED),
            sweeper: Mutex::new(None),
        })
    }

    /// Create a store and start its sweeper on the current runtime
    pub fn open(config: StoreConfig) -> Result<Self> {
        let store = Self::new(config)?;
        store.start()?;
        Ok(store)
    }

    /// Start the background sweeper. Returns `Ok(false)` if it is already
    /// running.
    pub fn start(&self) -> Result<bool> {
        let mut sweeper = self.sweeper.lock();
        match self.state() {
            StoreState::Stopped => return Err(Error::Closed),
            StoreState::Running => return Ok(false),
            StoreState::Created => {}
        }

        let handle = SweeperHandle::spawn(self.core(), self.config.sweep_interval)?;
        if self
            .state
            .compare_exchange(STATE_CREATED, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Closed while spawning
            handle.cancel();
            return Err(Error::Closed);
        }
        *sweeper = Some(handle);
        Ok(true)
    }

    /// Look up a live value
    pub fn get(&self, key: &str) -> Option<V> {
        if self.is_stopped() {
            return None;
        }
        self.core
            .shard(key)
            .get(key, Instant::now(), &self.core.counters)
    }

    /// Check for a live value without recording a hit or miss
    pub fn has(&self, key: &str) -> bool {
        !self.is_stopped() && self.core.shard(key).contains(key, Instant::now())
    }

    /// Store a value. A zero `ttl` falls back to the default TTL.
    pub fn set(&self, key: &str, value: V, ttl: Duration) -> Result<()> {
        self.set_with_tags(key, value, ttl, &[])
    }

    /// Store a value registered under `tags`
    pub fn set_with_tags(&self, key: &str, value: V, ttl: Duration, tags: &[&str]) -> Result<()> {
        self.ensure_open()?;
        let expires_at = compute_expiry(Instant::now(), ttl, self.config.default_ttl);
        let tags = owned_tags(tags);
        self.core
            .shard(key)
            .insert(
                key.to_owned(),
                value,
                &tags,
                expires_at,
                self.strategy.as_ref(),
                &self.core.counters,
            )
            .map(|_| ())
            .ok_or(Error::Closed)
    }

    /// Remove a key. Returns whether it existed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self
            .core
            .shard(key)
            .remove(key, &self.core.counters)
            .is_some())
    }

    /// Remove every entry carrying any of `tags`. Returns the number removed.
    ///
    /// Keys are collected from every shard first, then deleted shard by
    /// shard; no two shard locks are ever held together. A matching key
    /// written between the two phases may survive this call.
    #[instrument(skip(self))]
    pub fn delete_by_tags(&self, tags: &[&str]) -> Result<usize> {
        self.ensure_open()?;
        if tags.is_empty() {
            return Ok(0);
        }

        let collected: Vec<Vec<String>> = self
            .core
            .shards
            .iter()
            .map(|shard| shard.collect_tagged(tags))
            .collect();

        let mut removed = 0;
        for (shard, keys) in self.core.shards.iter().zip(collected) {
            if !keys.is_empty() {
                removed += shard.remove_keys(&keys, &self.core.counters);
            }
        }

        debug!("Invalidated {} entries by tag", removed);
        Ok(removed)
    }

    /// Refresh an entry's recency without reading it
    pub fn touch(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.core.shard(key).touch(key, Instant::now()))
    }

    /// Reset the expiry of a live entry to `now + ttl`; zero removes it
    pub fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.ensure_open()?;
        let now = Instant::now();
        let expires_at = if ttl.is_zero() { None } else { now.checked_add(ttl) };
        Ok(self.core.shard(key).set_expiry(key, expires_at, now))
    }

    /// Remaining lifetime, `None` if absent or never expiring
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        if self.is_stopped() {
            return None;
        }
        self.core.shard(key).remaining_ttl(key, Instant::now())
    }

    /// Return the cached value, or compute, store and return it. Concurrent
    /// callers for the same key run `f` once.
    ///
    /// `f` runs while the key's shard is write-locked, so it must not call
    /// back into this store; doing so can deadlock.
    pub fn get_or_set_with<F>(&self, key: &str, ttl: Duration, f: F) -> Result<V>
    where
        F: FnOnce() -> V,
    {
        self.ensure_open()?;
        let now = Instant::now();
        let expires_at = compute_expiry(now, ttl, self.config.default_ttl);
        self.core
            .shard(key)
            .get_or_insert_with(
                key,
                f,
                &[],
                expires_at,
                self.strategy.as_ref(),
                now,
                &self.core.counters,
            )
            .ok_or(Error::Closed)
    }

    /// Keys in the tag index under `tag`
    pub fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        if self.is_stopped() {
            return Vec::new();
        }
        let mut keys: Vec<String> = self
            .core
            .shards
            .iter()
            .flat_map(|shard| shard.keys_for_tag(tag))
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Tags of a live entry, sorted
    pub fn tags(&self, key: &str) -> Option<Vec<String>> {
        if self.is_stopped() {
            return None;
        }
        self.core.shard(key).tags_of(key, Instant::now())
    }

    /// Remove every entry, one shard at a time
    pub fn clear(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.clear_shards())
    }

    fn clear_shards(&self) -> usize {
        self.core
            .shards
            .iter()
            .map(|shard| shard.clear(&self.core.counters))
            .sum()
    }

    /// Evict entries idle for longer than `idle_for`
    pub fn evict_idle(&self, idle_for: Duration) -> Result<usize> {
        self.ensure_open()?;
        let evicted: usize = self
            .core
            .shards
            .iter()
            .map(|shard| shard.remove_idle(idle_for, &self.core.counters))
            .sum();
        if evicted > 0 {
            debug!("Evicted {} idle entries (idle_for={:?})", evicted, idle_for);
        }
        Ok(evicted)
    }

    /// Run one sweep on the calling thread
    pub fn sweep_expired(&self) -> usize {
        (0..self.core.shard_count())
            .map(|index| self.core.sweep_shard(index))
            .sum()
    }

    /// Run one sweep with shards in parallel on the blocking pool
    pub async fn sweep_expired_parallel(&self) -> usize {
        sweeper::sweep_pass(&self.core).await
    }

    /// Stop the sweeper, release every entry and reset counters. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.state.swap(STATE_STOPPED, Ordering::AcqRel) == STATE_STOPPED {
            return Ok(());
        }

        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            handle.shutdown().await;
        }

        // Sealing under each shard's write lock turns away writers that
        // passed the open check before the state flipped
        let released: usize = self
            .core
            .shards
            .iter()
            .map(|shard| shard.seal(&self.core.counters))
            .sum();
        for shard in self.core.shards.iter() {
            shard.reset_counters();
        }
        self.core.counters.reset();

        info!("Cache store closed, released {} entries", released);
        Ok(())
    }
}

impl<V> Drop for CacheStore<V> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.cancel();
        }
    }
}

fn owned_tags(tags: &[&str]) -> Vec<String> {
    tags.iter().map(|tag| (*tag).to_owned()).collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn config(shards: usize, max_entries: usize) -> StoreConfig {
        StoreConfig {
            shard_count: shards,
            max_entries,
            default_ttl: Duration::ZERO,
            sweep_interval: Duration::from_secs(60),
            eviction_policy: EvictionPolicy::Lru,
        }
    }

    fn store(shards: usize, max_entries: usize) -> CacheStore<String> {
        CacheStore::new(config(shards, max_entries)).unwrap()
    }

    fn tag_index_consistent<V>(store: &CacheStore<V>) -> bool {
        store.core.shards.iter().all(Shard::tag_index_consistent)
    }

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.max_entries, 100_000);
        assert_eq!(config.default_ttl, Duration::from_secs(3600));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.eviction_policy, EvictionPolicy::Lru);
        assert!(config.shard_count >= 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert_matches!(
            CacheStore::<u32>::new(config(0, 10)),
            Err(Error::InvalidConfig(_))
        );
        assert_matches!(
            CacheStore::<u32>::new(config(4, 0)),
            Err(Error::InvalidConfig(_))
        );
        let zero_sweep = StoreConfig {
            sweep_interval: Duration::ZERO,
            ..config(4, 10)
        };
        assert_matches!(CacheStore::<u32>::new(zero_sweep), Err(Error::InvalidConfig(_)));
    }

    #[test]
    fn test_shard_capacity_rounding() {
        assert_eq!(config(4, 100).shard_capacity(), 25);
        assert_eq!(config(3, 100).shard_capacity(), 33);
        assert_eq!(config(8, 4).shard_capacity(), 1);
    }

    #[test]
    fn test_config_serde_uses_duration_strings() {
        let json = serde_json::to_value(config(4, 10)).unwrap();
        assert_eq!(json["sweep_interval"], "1m");
        assert_eq!(json["eviction_policy"], "lru");

        let parsed: StoreConfig =
            serde_json::from_str(r#"{"shard_count": 2, "default_ttl": "90s", "eviction_policy": "ttl"}"#)
                .unwrap();
        assert_eq!(parsed.shard_count, 2);
        assert_eq!(parsed.default_ttl, Duration::from_secs(90));
        assert_eq!(parsed.eviction_policy, EvictionPolicy::Unordered);
        assert_eq!(parsed.max_entries, 100_000);
    }

    #[test]
    fn test_basic_operations() {
        let store = store(4, 100);
        assert_eq!(store.state(), StoreState::Created);

        store.set("u:1", "alice".into(), Duration::ZERO).unwrap();
        assert_eq!(store.get("u:1").as_deref(), Some("alice"));
        assert!(store.has("u:1"));
        assert_eq!(store.size(), 1);

        assert!(store.delete("u:1").unwrap());
        assert!(!store.delete("u:1").unwrap());
        assert_eq!(store.get("u:1"), None);
        assert_eq!(store.size(), 0);

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.shards.len(), 4);
    }

    #[test]
    fn test_has_does_not_count() {
        let store = store(2, 10);
        store.set("k", "v".into(), Duration::ZERO).unwrap();
        assert!(store.has("k"));
        assert!(!store.has("other"));
        let stats = store.stats();
        assert_eq!(stats.hits + stats.misses, 0);
    }

    #[test]
    fn test_default_ttl_applies_to_zero_ttl() {
        let config = StoreConfig {
            default_ttl: Duration::from_secs(60),
            ..config(2, 10)
        };
        let store: CacheStore<u32> = CacheStore::new(config).unwrap();
        store.set("k", 1, Duration::ZERO).unwrap();
        let ttl = store.ttl("k").unwrap();
        assert!(ttl <= Duration::from_secs(60));
        assert!(ttl > Duration::from_secs(55));
    }

    #[test]
    fn test_ttl_expiry_without_sweeper() {
        let store = store(2, 10);
        store.set("k", "v".into(), Duration::from_millis(30)).unwrap();
        assert!(store.get("k").is_some());

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(store.get("k"), None);
        assert!(!store.has("k"));
        assert_eq!(store.stats().expirations, 1);
    }

    #[test]
    fn test_lru_scenario() {
        let store = store(1, 4);
        for key in ["a", "b", "c", "d"] {
            store.set(key, key.into(), Duration::ZERO).unwrap();
        }
        assert!(store.get("a").is_some());
        store.set("e", "e".into(), Duration::ZERO).unwrap();

        assert!(store.has("a"));
        assert!(store.has("e"));
        let survivors = ["b", "c", "d"].iter().filter(|k| store.has(k)).count();
        assert_eq!(survivors, 2);
        assert_eq!(store.size(), 4);
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_eviction_only_at_capacity() {
        let store = store(1, 10);
        for i in 0..10 {
            store.set(&format!("k{}", i), String::new(), Duration::ZERO).unwrap();
        }
        assert_eq!(store.stats().evictions, 0);

        store.set("overflow", String::new(), Duration::ZERO).unwrap();
        assert_eq!(store.stats().evictions, 1);
        assert_eq!(store.size(), 10);
    }

    #[test]
    fn test_overwrite_at_capacity_does_not_evict() {
        let store = store(1, 2);
        store.set("a", "1".into(), Duration::ZERO).unwrap();
        store.set("b", "1".into(), Duration::ZERO).unwrap();
        store.set("a", "2".into(), Duration::ZERO).unwrap();

        assert_eq!(store.stats().evictions, 0);
        assert_eq!(store.get("a").as_deref(), Some("2"));
        assert!(store.has("b"));
    }

    #[test]
    fn test_tag_invalidation_scenario() {
        let store = store(4, 100);
        let ttl = Duration::from_secs(60);
        store.set_with_tags("p:1", "v".into(), ttl, &["post"]).unwrap();
        store.set_with_tags("p:2", "v".into(), ttl, &["post"]).unwrap();
        store.set_with_tags("u:1", "v".into(), ttl, &["user"]).unwrap();

        assert_eq!(store.delete_by_tags(&["post"]).unwrap(), 2);
        assert!(!store.has("p:1"));
        assert!(!store.has("p:2"));
        assert!(store.has("u:1"));

        // Second call is a no-op
        assert_eq!(store.delete_by_tags(&["post"]).unwrap(), 0);
        assert_eq!(store.delete_by_tags(&[]).unwrap(), 0);
        assert!(store.keys_for_tag("post").is_empty());
        assert!(tag_index_consistent(&store));
    }

    #[test]
    fn test_delete_by_multiple_tags() {
        let store = store(8, 100);
        store.set_with_tags("a", "v".into(), Duration::ZERO, &["x", "y"]).unwrap();
        store.set_with_tags("b", "v".into(), Duration::ZERO, &["y"]).unwrap();
        store.set_with_tags("c", "v".into(), Duration::ZERO, &["z"]).unwrap();

        assert_eq!(store.keys_for_tag("y"), vec!["a", "b"]);
        assert_eq!(store.delete_by_tags(&["x", "y"]).unwrap(), 2);
        assert_eq!(store.size(), 1);
        assert!(tag_index_consistent(&store));
    }

    #[test]
    fn test_retag_moves_key_between_tags() {
        let store = store(2, 10);
        store.set_with_tags("k", "v".into(), Duration::ZERO, &["old"]).unwrap();
        store.set_with_tags("k", "v".into(), Duration::ZERO, &["new"]).unwrap();

        assert_eq!(store.delete_by_tags(&["old"]).unwrap(), 0);
        assert!(store.has("k"));
        assert_eq!(store.keys_for_tag("new"), vec!["k"]);
        assert_eq!(store.tags("k"), Some(vec!["new".to_string()]));
        assert_eq!(store.tags("missing"), None);
    }

    #[test]
    fn test_touch_expire_and_ttl() {
        let store = store(2, 10);
        store.set("k", "v".into(), Duration::ZERO).unwrap();
        assert_eq!(store.ttl("k"), None);
        assert!(store.touch("k").unwrap());
        assert!(!store.touch("missing").unwrap());

        assert!(store.expire("k", Duration::from_secs(30)).unwrap());
        assert!(store.ttl("k").unwrap() <= Duration::from_secs(30));

        assert!(store.expire("k", Duration::ZERO).unwrap());
        assert_eq!(store.ttl("k"), None);
        assert!(!store.expire("missing", Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn test_get_or_set_with() {
        let store = store(2, 10);
        let first = store
            .get_or_set_with("k", Duration::ZERO, || "computed".to_string())
            .unwrap();
        let second = store
            .get_or_set_with("k", Duration::ZERO, || "other".to_string())
            .unwrap();
        assert_eq!(first, "computed");
        assert_eq!(second, "computed");
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn test_evict_idle() {
        let store = store(2, 10);
        store.set("cold", "v".into(), Duration::ZERO).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        store.set("warm", "v".into(), Duration::ZERO).unwrap();

        assert_eq!(store.evict_idle(Duration::from_millis(20)).unwrap(), 1);
        assert!(!store.has("cold"));
        assert!(store.has("warm"));
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_sweep_expired_sync() {
        let store = store(4, 100);
        for i in 0..10 {
            store
                .set_with_tags(&format!("k{}", i), "v".into(), Duration::from_millis(1), &["t"])
                .unwrap();
        }
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(store.sweep_expired(), 10);
        assert_eq!(store.size(), 0);
        assert!(store.keys_for_tag("t").is_empty());
    }

    #[test]
    fn test_clear() {
        let store = store(4, 100);
        for i in 0..10 {
            store.set(&format!("k{}", i), "v".into(), Duration::ZERO).unwrap();
        }
        assert_eq!(store.clear().unwrap(), 10);
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_start_requires_runtime() {
        let store = store(2, 10);
        assert_matches!(store.start(), Err(Error::NoRuntime(_)));
        assert_eq!(store.state(), StoreState::Created);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let store = store(2, 10);
        assert!(store.start().unwrap());
        assert!(!store.start().unwrap());
        assert_eq!(store.state(), StoreState::Running);

        store.set("k", "v".into(), Duration::ZERO).unwrap();
        store.close().await.unwrap();
        store.close().await.unwrap();
        assert_eq!(store.state(), StoreState::Stopped);

        assert_eq!(store.get("k"), None);
        assert!(!store.has("k"));
        assert_eq!(store.ttl("k"), None);
        assert_eq!(store.size(), 0);
        assert_matches!(store.set("k", "v".into(), Duration::ZERO), Err(Error::Closed));
        assert_matches!(store.delete("k"), Err(Error::Closed));
        assert_matches!(store.delete_by_tags(&["t"]), Err(Error::Closed));
        assert_matches!(store.start(), Err(Error::Closed));

        let stats = store.stats();
        assert_eq!(stats.hits + stats.misses, 0);
    }

    #[tokio::test]
    async fn test_write_racing_close_is_refused() {
        let store = store(2, 10);
        // Writer that already passed the open check when close begins
        let shard = store.core.shard("k");
        store.close().await.unwrap();

        let landed = shard.insert(
            "k".into(),
            "v".into(),
            &[],
            None,
            store.strategy.as_ref(),
            &store.core.counters,
        );
        assert_eq!(landed, None);
        assert!(store.core.shards.iter().all(|s| s.keys().is_empty()));
        assert_eq!(store.stats().size, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_under_concurrent_writes_leaves_nothing() {
        let store = Arc::new(store(4, 10_000));
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut i = 0u64;
                    while store
                        .set(&format!("{}-{}", t, i), "v".into(), Duration::ZERO)
                        .is_ok()
                    {
                        i += 1;
                    }
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.close().await.unwrap();
        for writer in writers {
            writer.join().unwrap();
        }

        assert!(store.core.shards.iter().all(|s| s.keys().is_empty()));
        assert_eq!(store.size(), 0);
        assert_eq!(store.stats().size, 0);
    }

    #[tokio::test]
    async fn test_close_without_start() {
        let store = store(2, 10);
        store.set("k", "v".into(), Duration::ZERO).unwrap();
        store.close().await.unwrap();
        assert_eq!(store.state(), StoreState::Stopped);
        assert_eq!(store.size(), 0);
    }

    #[tokio::test]
    async fn test_open_starts_sweeper() {
        let store: CacheStore<u32> = CacheStore::open(config(2, 10)).unwrap();
        assert_eq!(store.state(), StoreState::Running);
        store.close().await.unwrap();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(u8, Vec<u8>),
        Delete(u8),
        DeleteTag(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..32, prop::collection::vec(0u8..4, 0..3)).prop_map(|(k, t)| Op::Set(k, t)),
            (0u8..32).prop_map(Op::Delete),
            (0u8..4).prop_map(Op::DeleteTag),
        ]
    }

    proptest! {
        #[test]
        fn prop_keys_unique_and_tags_consistent(ops in prop::collection::vec(op_strategy(), 1..200)) {
            let store: CacheStore<u32> = CacheStore::new(config(4, 10_000)).unwrap();
            let mut model: std::collections::HashMap<String, HashSet<String>> = Default::default();

            for op in ops {
                match op {
                    Op::Set(k, tags) => {
                        let key = format!("k{}", k);
                        let tags: Vec<String> = tags.iter().map(|t| format!("t{}", t)).collect();
                        let refs: Vec<&str> = tags.iter().map(String::as_str).collect();
                        store.set_with_tags(&key, 0, Duration::ZERO, &refs).unwrap();
                        model.insert(key, tags.into_iter().collect());
                    }
                    Op::Delete(k) => {
                        let key = format!("k{}", k);
                        prop_assert_eq!(store.delete(&key).unwrap(), model.remove(&key).is_some());
                    }
                    Op::DeleteTag(t) => {
                        let tag = format!("t{}", t);
                        let before = model.len();
                        model.retain(|_, tags| !tags.contains(&tag));
                        prop_assert_eq!(store.delete_by_tags(&[tag.as_str()]).unwrap(), before - model.len());
                    }
                }
            }

            prop_assert_eq!(store.size(), model.len());
            prop_assert!(tag_index_consistent(&store));

            // Every key lives only in the shard it routes to
            let mut seen = HashSet::new();
            for (index, shard) in store.core.shards.iter().enumerate() {
                for key in shard.keys() {
                    prop_assert_eq!(store.shard_for(&key), index);
                    prop_assert!(seen.insert(key));
                }
            }
            prop_assert_eq!(seen.len(), model.len());
        }
    }
}
