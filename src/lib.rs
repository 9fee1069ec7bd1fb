//! tiercache - Tiered, Sharded, Concurrent Cache Engine
//!
//! An embeddable in-process cache for query results, computed values and
//! model snapshots. A shard-partitioned store handles high concurrent
//! read/write throughput with bounded memory and tag-based bulk
//! invalidation; a tier manager layers it above optional local and remote
//! adapters with read-through promotion and write-through fan-out.
//!
//! # Architecture
//!
//! ```text
//! callers ─► CacheManager ─► Fast (CacheStore) ─► Local ─► Remote
//!                               │
//!                               └─► ShardRouter ─► Shard[i] (RwLock)
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Sharded store, eviction strategies, sweeper
//! - [`tier`] - Tier manager, backend contract, in-memory adapter
//! - [`config`] - Duration parsing and configuration files
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus exporter
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tiercache::{CacheStore, StoreConfig};
//!
//! # fn main() -> tiercache::Result<()> {
//! let store: CacheStore<String> = CacheStore::new(StoreConfig::default())?;
//! store.set_with_tags("u:1", "alice".into(), Duration::from_secs(60), &["user"])?;
//! assert_eq!(store.get("u:1").as_deref(), Some("alice"));
//! store.delete_by_tags(&["user"])?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod tier;

// Re-export commonly used types
pub use cache::{CacheStore, EvictionPolicy, EvictionStrategy, StoreConfig, StoreStats};
pub use error::{Error, Result};
pub use metrics::CacheExporter;
pub use tier::{CacheBackend, CacheManager, CacheTier, InMemoryBackend, TieredConfig};
