//! Shard Implementation
//!
//! One independently locked partition of the keyspace: its entries, the tag
//! index for those entries, and shard-local counters.
//!
//! # Design
//!
//! - Each shard has its own RwLock, minimizing contention
//! - Hits update entry metadata through atomics under the shared lock
//! - Entries and tag index change together, inside one write critical section
//! - Cache-line alignment between shards prevents false sharing

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::trace;

use super::entry::{now_millis, CacheEntry};
use super::policy::EvictionStrategy;
use super::stats::{Counters, ShardStats};

/// Entries plus the reverse tag index, guarded together
struct ShardInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    tag_index: HashMap<String, HashSet<String>>,
    /// Set once the owning store is closed; inserts are refused afterwards
    sealed: bool,
}

impl<V> ShardInner<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            tag_index: HashMap::new(),
            sealed: false,
        }
    }

    /// Insert an entry and register its tags
    fn attach(&mut self, key: String, entry: CacheEntry<V>) {
        for tag in entry.tags() {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        self.entries.insert(key, entry);
    }

    /// Remove an entry and every tag registration it holds
    fn detach(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        for tag in entry.tags() {
            if let Some(keys) = self.tag_index.get_mut(tag.as_str()) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag.as_str());
                }
            }
        }
        Some(entry)
    }
}

/// Single shard containing entries, tag index and statistics
#[repr(C, align(64))]
pub(crate) struct Shard<V> {
    index: usize,
    /// Maximum entries held before eviction kicks in
    capacity: usize,
    inner: RwLock<ShardInner<V>>,
    /// Logical clock ordering accesses within this shard
    clock: AtomicU64,
    counters: Counters,
}

impl<V> Shard<V> {
    /// Create an empty shard
    pub fn new(index: usize, capacity: usize) -> Self {
        Self {
            index,
            capacity: capacity.max(1),
            inner: RwLock::new(ShardInner::new()),
            clock: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    #[inline]
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries held
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.counters.size() as usize
    }

    fn record_hit(&self, global: &Counters) {
        self.counters.record_hit();
        global.record_hit();
    }

    fn record_miss(&self, global: &Counters) {
        self.counters.record_miss();
        global.record_miss();
    }

    fn record_expiration(&self, global: &Counters) {
        self.counters.record_expiration();
        global.record_expiration();
    }

    fn occupy_slot(&self, global: &Counters) {
        self.counters.inc_size();
        global.inc_size();
    }

    fn release_slot(&self, global: &Counters) {
        self.counters.dec_size();
        global.dec_size();
    }

    /// Look up a live value, recording a hit or a miss.
    ///
    /// An expired entry counts as a miss. Its removal is attempted without
    /// waiting for the write lock; if the shard is busy the sweeper reclaims
    /// it later.
    pub fn get(&self, key: &str, now: Instant, global: &Counters) -> Option<V>
    where
        V: Clone,
    {
        {
            let guard = self.inner.read();
            match guard.entries.get(key) {
                Some(entry) if !entry.is_expired_at(now) => {
                    entry.metadata.record_access(self.tick());
                    self.record_hit(global);
                    return Some(entry.value().clone());
                }
                Some(entry) => {
                    if entry.metadata.claim_expiry() {
                        self.record_expiration(global);
                    }
                }
                None => {
                    self.record_miss(global);
                    return None;
                }
            }
        }

        self.record_miss(global);
        self.try_reap(key, now, global);
        None
    }

    fn try_reap(&self, key: &str, now: Instant, global: &Counters) {
        if let Some(mut guard) = self.inner.try_write() {
            let still_expired = guard
                .entries
                .get(key)
                .is_some_and(|entry| entry.is_expired_at(now));
            if still_expired && guard.detach(key).is_some() {
                self.release_slot(global);
            }
        }
    }

    /// Check for a live entry without touching metadata or counters
    pub fn contains(&self, key: &str, now: Instant) -> bool {
        self.inner
            .read()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired_at(now))
    }

    /// Insert or replace an entry, evicting as needed. Returns the number of
    /// entries evicted to make room, or `None` if the shard is sealed.
    pub fn insert(
        &self,
        key: String,
        value: V,
        tags: &[String],
        expires_at: Option<Instant>,
        strategy: &dyn EvictionStrategy,
        global: &Counters,
    ) -> Option<usize> {
        let entry = CacheEntry::new(value, tags, expires_at, self.tick());
        let mut guard = self.inner.write();
        if guard.sealed {
            return None;
        }
        Some(self.store_locked(&mut guard, key, entry, strategy, global))
    }

    fn store_locked(
        &self,
        inner: &mut ShardInner<V>,
        key: String,
        entry: CacheEntry<V>,
        strategy: &dyn EvictionStrategy,
        global: &Counters,
    ) -> usize {
        // Drop the old entry first so its tags never dangle
        if inner.detach(&key).is_some() {
            self.release_slot(global);
        }
        let evicted = self.make_room(inner, strategy, global);
        inner.attach(key, entry);
        self.occupy_slot(global);
        evicted
    }

    /// Evict until one slot is free or the strategy stops making progress
    fn make_room(
        &self,
        inner: &mut ShardInner<V>,
        strategy: &dyn EvictionStrategy,
        global: &Counters,
    ) -> usize {
        let mut evicted = 0;
        while inner.entries.len() >= self.capacity {
            let victim = {
                let mut candidates = inner
                    .entries
                    .iter()
                    .map(|(key, entry)| (key.as_str(), &entry.metadata));
                match strategy.select_victim(&mut candidates) {
                    Some(key) => key.to_owned(),
                    None => break,
                }
            };
            if inner.detach(&victim).is_none() {
                break;
            }
            self.release_slot(global);
            self.counters.record_eviction();
            global.record_eviction();
            evicted += 1;
        }
        if evicted > 0 {
            trace!(
                shard = self.index,
                evicted,
                strategy = strategy.name(),
                "evicted entries at capacity"
            );
        }
        evicted
    }

    /// Return the live value, or compute and store it while holding the
    /// write lock so concurrent callers compute it once. `f` must not call
    /// back into this shard. Returns `None` if the shard is sealed.
    #[allow(clippy::too_many_arguments)]
    pub fn get_or_insert_with<F>(
        &self,
        key: &str,
        f: F,
        tags: &[String],
        expires_at: Option<Instant>,
        strategy: &dyn EvictionStrategy,
        now: Instant,
        global: &Counters,
    ) -> Option<V>
    where
        V: Clone,
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get(key, now, global) {
            return Some(value);
        }

        let mut guard = self.inner.write();
        if guard.sealed {
            return None;
        }
        if let Some(entry) = guard.entries.get(key).filter(|e| !e.is_expired_at(now)) {
            // Filled by a concurrent caller after our miss
            entry.metadata.record_access(self.tick());
            self.record_hit(global);
            return Some(entry.value().clone());
        }

        let value = f();
        let entry = CacheEntry::new(value.clone(), tags, expires_at, self.tick());
        self.store_locked(&mut guard, key.to_owned(), entry, strategy, global);
        Some(value)
    }

    /// Remove an entry and its tag registrations
    pub fn remove(&self, key: &str, global: &Counters) -> Option<V> {
        let removed = self.inner.write().detach(key);
        if removed.is_some() {
            self.release_slot(global);
        }
        removed.map(CacheEntry::into_value)
    }

    /// Remove a batch of keys under one write lock; absent keys are skipped
    pub fn remove_keys(&self, keys: &[String], global: &Counters) -> usize {
        let mut guard = self.inner.write();
        let mut removed = 0;
        for key in keys {
            if guard.detach(key).is_some() {
                self.release_slot(global);
                removed += 1;
            }
        }
        removed
    }

    /// Union of keys registered under any of `tags`
    pub fn collect_tagged(&self, tags: &[&str]) -> Vec<String> {
        let guard = self.inner.read();
        let mut keys: HashSet<&String> = HashSet::new();
        for tag in tags {
            if let Some(tagged) = guard.tag_index.get(*tag) {
                keys.extend(tagged.iter());
            }
        }
        keys.into_iter().cloned().collect()
    }

    /// Keys currently carrying `tag`, sorted
    pub fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        let guard = self.inner.read();
        let mut keys: Vec<String> = guard
            .tag_index
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort_unstable();
        keys
    }

    /// Tags of a live entry
    pub fn tags_of(&self, key: &str, now: Instant) -> Option<Vec<String>> {
        self.inner
            .read()
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.tags().to_vec())
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn remove_expired(&self, now: Instant, global: &Counters) -> usize {
        let mut guard = self.inner.write();
        let expired: Vec<String> = guard
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = guard.detach(key) {
                if entry.metadata.claim_expiry() {
                    self.record_expiration(global);
                }
                self.release_slot(global);
            }
        }
        expired.len()
    }

    /// Remove entries not accessed within `idle_for`, counted as evictions
    pub fn remove_idle(&self, idle_for: Duration, global: &Counters) -> usize {
        let idle_ms = u64::try_from(idle_for.as_millis()).unwrap_or(u64::MAX);
        let Some(cutoff) = now_millis().checked_sub(idle_ms) else {
            return 0;
        };

        let mut guard = self.inner.write();
        let cold: Vec<String> = guard
            .entries
            .iter()
            .filter(|(_, entry)| entry.metadata.access_time() < cutoff)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &cold {
            if guard.detach(key).is_some() {
                self.release_slot(global);
                self.counters.record_eviction();
                global.record_eviction();
            }
        }
        cold.len()
    }

    /// Refresh recency of a live entry without reading it
    pub fn touch(&self, key: &str, now: Instant) -> bool {
        let guard = self.inner.read();
        match guard.entries.get(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                entry.metadata.touch(self.tick());
                true
            }
            _ => false,
        }
    }

    /// Replace the expiry of a live entry
    pub fn set_expiry(&self, key: &str, expires_at: Option<Instant>, now: Instant) -> bool {
        let mut guard = self.inner.write();
        match guard.entries.get_mut(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                entry.metadata.set_expires_at(expires_at);
                true
            }
            _ => false,
        }
    }

    /// Remaining lifetime of a live, expiring entry
    pub fn remaining_ttl(&self, key: &str, now: Instant) -> Option<Duration> {
        let guard = self.inner.read();
        guard
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired_at(now))
            .and_then(|entry| entry.metadata.remaining_ttl(now))
    }

    /// Clear all entries. Returns the number removed.
    pub fn clear(&self, global: &Counters) -> usize {
        let mut guard = self.inner.write();
        self.clear_locked(&mut guard, global)
    }

    /// Clear all entries and refuse every later insert
    pub fn seal(&self, global: &Counters) -> usize {
        let mut guard = self.inner.write();
        guard.sealed = true;
        self.clear_locked(&mut guard, global)
    }

    fn clear_locked(&self, inner: &mut ShardInner<V>, global: &Counters) -> usize {
        let removed = inner.entries.len();
        inner.entries.clear();
        inner.tag_index.clear();
        self.counters.sub_size(removed as u64);
        global.sub_size(removed as u64);
        removed
    }

    pub fn reset_counters(&self) {
        self.counters.reset();
    }

    pub fn stats(&self) -> ShardStats {
        let tags = self.inner.read().tag_index.len();
        ShardStats {
            index: self.index,
            entries: self.counters.size(),
            tags,
            hits: self.counters.hits(),
            misses: self.counters.misses(),
            evictions: self.counters.evictions(),
            expirations: self.counters.expirations(),
        }
    }

    /// Held keys, sorted
    #[cfg(test)]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.read().entries.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Verify that the entry map and the tag index agree in both directions
    #[cfg(test)]
    pub fn tag_index_consistent(&self) -> bool {
        let guard = self.inner.read();
        let forward = guard.entries.iter().all(|(key, entry)| {
            entry.tags().iter().all(|tag| {
                guard
                    .tag_index
                    .get(tag.as_str())
                    .is_some_and(|keys| keys.contains(key))
            })
        });
        let reverse = guard.tag_index.iter().all(|(tag, keys)| {
            !keys.is_empty()
                && keys.iter().all(|key| {
                    guard
                        .entries
                        .get(key)
                        .is_some_and(|entry| entry.has_tag(tag))
                })
        });
        forward && reverse
    }
}

// =============================================================================
// Tests
// =============================================================================
