//! Sharded Cache Store
//!
//! In-process key/value store partitioned into independently locked shards.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          CacheStore                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │   key ──► ShardRouter (FNV-1a 32 % shard_count)                  │
//! │                    │                                             │
//! │     ┌──────────────┼──────────────┬──────────────┐               │
//! │     ▼              ▼              ▼              ▼               │
//! │  ┌────────┐    ┌────────┐    ┌────────┐    ┌────────┐            │
//! │  │ Shard 0│    │ Shard 1│    │  ...   │    │ Shard N│            │
//! │  │ RwLock │    │ RwLock │    │        │    │ RwLock │            │
//! │  │ entries│    │ entries│    │        │    │ entries│            │
//! │  │ tags   │    │ tags   │    │        │    │ tags   │            │
//! │  └────────┘    └────────┘    └────────┘    └────────┘            │
//! │                                                                  │
//! │   Sweeper: one spawn_blocking pass per shard, every interval     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - Cross-shard operations never hold two shard locks
//! - Hits are recorded with atomics under the shared lock
//! - Capacity is enforced by eviction at insert time, never by rejecting writes
//! - Expiry is checked on every read; the sweeper only reclaims memory

mod entry;
mod policy;
mod router;
mod shard;
mod stats;
mod store;
mod sweeper;

pub use entry::{compute_expiry, now_millis, CacheEntry, EntryMetadata};
pub use policy::{EvictionPolicy, EvictionStrategy, LfuStrategy, LruStrategy, UnorderedStrategy};
pub use router::{fnv1a_32, ShardRouter};
pub use stats::{ShardStats, StoreStats};
pub use store::{CacheStore, StoreConfig, StoreState};

/// Default upper bound on live entries per store
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;
