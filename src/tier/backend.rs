//! Tier Backend Contract
//!
//! Minimal get/set/delete surface every tier satisfies, so any external
//! key/value service can be plugged in behind an adapter.

use std::time::Duration;

use async_trait::async_trait;

use crate::cache::CacheStore;
use crate::error::Result;

/// Storage backend for one cache tier
#[async_trait]
pub trait CacheBackend<V>: Send + Sync
where
    V: Send + Sync + 'static,
{
    /// Backend name used in logs
    fn name(&self) -> &str;

    /// Fetch a live value
    async fn get(&self, key: &str) -> Result<Option<V>>;

    /// Store a value. A zero `ttl` means the backend's own default.
    async fn set(&self, key: &str, value: V, ttl: Duration, tags: &[&str]) -> Result<()>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove every entry carrying any of `tags`. Backends without a tag
    /// index report nothing removed.
    async fn delete_by_tags(&self, _tags: &[&str]) -> Result<usize> {
        Ok(0)
    }

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Tags recorded for a key, used to carry tags along on promotion
    async fn tags(&self, _key: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Drop entries idle for longer than `idle_for`
    async fn evict_idle(&self, _idle_for: Duration) -> Result<usize> {
        Ok(0)
    }

    /// Entry count, if the backend can report one cheaply
    fn entry_count(&self) -> Option<usize> {
        None
    }

    /// Release backend resources
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<V> CacheBackend<V> for CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "sharded-store"
    }

    async fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(CacheStore::get(self, key))
    }

    async fn set(&self, key: &str, value: V, ttl: Duration, tags: &[&str]) -> Result<()> {
        self.set_with_tags(key, value, ttl, tags)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        CacheStore::delete(self, key)
    }

    async fn delete_by_tags(&self, tags: &[&str]) -> Result<usize> {
        CacheStore::delete_by_tags(self, tags)
    }

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(CacheStore::has(self, key))
    }

    async fn tags(&self, key: &str) -> Result<Vec<String>> {
        Ok(CacheStore::tags(self, key).unwrap_or_default())
    }

    async fn evict_idle(&self, idle_for: Duration) -> Result<usize> {
        CacheStore::evict_idle(self, idle_for)
    }

    fn entry_count(&self) -> Option<usize> {
        Some(self.size())
    }

    async fn close(&self) -> Result<()> {
        CacheStore::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StoreConfig;
    use std::sync::Arc;

    fn store() -> Arc<dyn CacheBackend<String>> {
        let config = StoreConfig {
            shard_count: 4,
            max_entries: 100,
            ..Default::default()
        };
        Arc::new(CacheStore::new(config).unwrap())
    }

    #[tokio::test]
    async fn test_store_as_backend() {
        let backend = store();
        assert_eq!(backend.name(), "sharded-store");

        backend
            .set("k", "v".to_string(), Duration::ZERO, &["t"])
            .await
            .unwrap();
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(backend.has("k").await.unwrap());
        assert_eq!(backend.tags("k").await.unwrap(), vec!["t".to_string()]);
        assert_eq!(backend.entry_count(), Some(1));

        assert_eq!(backend.delete_by_tags(&["t"]).await.unwrap(), 1);
        assert!(!backend.delete("k").await.unwrap());

        backend.close().await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), None);
    }
}
