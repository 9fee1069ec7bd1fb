//! In-Memory Backend
//!
//! DashMap-backed stand-in for a local or remote key/value service. Supports
//! TTLs and tags, counts operations, and can simulate latency and outages so
//! tier behaviour can be exercised without a real service.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;

use super::backend::CacheBackend;
use crate::cache::now_millis;
use crate::error::{Error, Result};

struct StoredValue<V> {
    value: V,
    tags: Vec<String>,
    expires_at: Option<Instant>,
    last_access: AtomicU64,
}

impl<V> StoredValue<V> {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }
}

/// Backend operation counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendStats {
    pub entries: u64,
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub failures: u64,
}

/// Concurrent in-memory backend
pub struct InMemoryBackend<V> {
    name: String,
    storage: DashMap<String, StoredValue<V>>,
    default_ttl: Duration,
    latency: Duration,
    unavailable: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    failures: AtomicU64,
}

impl<V> InMemoryBackend<V> {
    /// Create an empty backend whose entries never expire by default
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: DashMap::new(),
            default_ttl: Duration::ZERO,
            latency: Duration::ZERO,
            unavailable: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// TTL used when a write passes zero
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Delay every operation, approximating a network round trip
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make every operation fail until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            entries: self.storage.len() as u64,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Check for a key without counting a read or waiting on latency
    pub fn contains(&self, key: &str) -> bool {
        self.storage
            .get(key)
            .is_some_and(|stored| !stored.is_expired(Instant::now()))
    }

    async fn round_trip(&self, counter: &AtomicU64) -> Result<()> {
        counter.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.unavailable.load(Ordering::Relaxed) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(Error::backend(&self.name, "service unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl<V> CacheBackend<V> for InMemoryBackend<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<V>> {
        self.round_trip(&self.reads).await?;

        let now = Instant::now();
        if let Some(stored) = self.storage.get(key) {
            if !stored.is_expired(now) {
                stored.last_access.store(now_millis(), Ordering::Relaxed);
                return Ok(Some(stored.value.clone()));
            }
        }
        self.storage.remove_if(key, |_, stored| stored.is_expired(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: V, ttl: Duration, tags: &[&str]) -> Result<()> {
        self.round_trip(&self.writes).await?;

        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Instant::now().checked_add(ttl)
        };
        let mut tags: Vec<String> = tags.iter().map(|tag| (*tag).to_owned()).collect();
        tags.sort_unstable();
        tags.dedup();

        self.storage.insert(
            key.to_owned(),
            StoredValue {
                value,
                tags,
                expires_at,
                last_access: AtomicU64::new(now_millis()),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.round_trip(&self.deletes).await?;
        Ok(self.storage.remove(key).is_some())
    }

    async fn delete_by_tags(&self, tags: &[&str]) -> Result<usize> {
        self.round_trip(&self.deletes).await?;

        let mut removed = 0;
        self.storage.retain(|_, stored| {
            let tagged = stored.tags.iter().any(|tag| tags.contains(&tag.as_str()));
            if tagged {
                removed += 1;
            }
            !tagged
        });
        Ok(removed)
    }

    async fn has(&self, key: &str) -> Result<bool> {
        self.round_trip(&self.reads).await?;
        Ok(self.contains(key))
    }

    async fn tags(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .storage
            .get(key)
            .map(|stored| stored.tags.clone())
            .unwrap_or_default())
    }

    async fn evict_idle(&self, idle_for: Duration) -> Result<usize> {
        let idle_ms = u64::try_from(idle_for.as_millis()).unwrap_or(u64::MAX);
        let Some(cutoff) = now_millis().checked_sub(idle_ms) else {
            return Ok(0);
        };
        let before = self.storage.len();
        self.storage
            .retain(|_, stored| stored.last_access.load(Ordering::Relaxed) >= cutoff);
        Ok(before.saturating_sub(self.storage.len()))
    }

    fn entry_count(&self) -> Option<usize> {
        Some(self.storage.len())
    }

    async fn close(&self) -> Result<()> {
        self.storage.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_in_memory_backend() {
        let backend: InMemoryBackend<u64> = InMemoryBackend::new("remote");
        assert_eq!(CacheBackend::<u64>::name(&backend), "remote");

        backend.set("k", 7, Duration::ZERO, &[]).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(7));
        assert!(backend.has("k").await.unwrap());
        assert!(backend.delete("k").await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), None);

        let stats = backend.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 3);
        assert_eq!(stats.deletes, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let backend: InMemoryBackend<u64> = InMemoryBackend::new("remote");
        backend
            .set("k", 1, Duration::from_millis(20), &[])
            .await
            .unwrap();
        assert!(backend.contains("k"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_default_ttl() {
        let backend: InMemoryBackend<u64> =
            InMemoryBackend::new("remote").with_default_ttl(Duration::from_millis(20));
        backend.set("k", 1, Duration::ZERO, &[]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!backend.contains("k"));
    }

    #[tokio::test]
    async fn test_delete_by_tags_and_tags() {
        let backend: InMemoryBackend<u64> = InMemoryBackend::new("remote");
        backend.set("a", 1, Duration::ZERO, &["x", "x"]).await.unwrap();
        backend.set("b", 2, Duration::ZERO, &["y"]).await.unwrap();

        assert_eq!(backend.tags("a").await.unwrap(), vec!["x".to_string()]);
        assert_eq!(backend.delete_by_tags(&["x"]).await.unwrap(), 1);
        assert_eq!(backend.delete_by_tags(&["x"]).await.unwrap(), 0);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_backend_fails() {
        let backend: InMemoryBackend<u64> = InMemoryBackend::new("remote");
        backend.set_unavailable(true);

        assert_matches!(
            backend.set("k", 1, Duration::ZERO, &[]).await,
            Err(Error::Backend { .. })
        );
        assert_matches!(backend.get("k").await, Err(Error::Backend { .. }));
        assert_eq!(backend.stats().failures, 2);

        backend.set_unavailable(false);
        assert!(backend.set("k", 1, Duration::ZERO, &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let backend: InMemoryBackend<u64> = InMemoryBackend::new("local");
        backend.set("cold", 1, Duration::ZERO, &[]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        backend.set("warm", 2, Duration::ZERO, &[]).await.unwrap();

        assert_eq!(backend.evict_idle(Duration::from_millis(20)).await.unwrap(), 1);
        assert!(backend.contains("warm"));
        assert!(!backend.contains("cold"));
    }

    #[tokio::test]
    async fn test_evict_idle_with_unbounded_duration() {
        let backend: InMemoryBackend<u64> = InMemoryBackend::new("local");
        backend.set("k", 1, Duration::ZERO, &[]).await.unwrap();

        assert_eq!(backend.evict_idle(Duration::MAX).await.unwrap(), 0);
        assert!(backend.contains("k"));
    }
}
