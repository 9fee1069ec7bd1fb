//! Tiered Cache
//!
//! Chains the in-process store with optional local and remote adapters.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         CacheManager                             │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Fast (CacheStore)   │ Local (adapter)      │ Remote (adapter)   │
//! │  ┌────────────────┐  │ ┌────────────────┐   │ ┌────────────────┐ │
//! │  │ sharded,       │  │ │ CacheBackend   │   │ │ CacheBackend   │ │
//! │  │ in-memory      │  │ │ impl           │   │ │ impl           │ │
//! │  └────────────────┘  │ └────────────────┘   │ └────────────────┘ │
//! │         ▲            │         ▲            │         │          │
//! │         └────────────┴─────────┴────────────┴─────────┘          │
//! │                    promotion on read hit                         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

mod backend;
mod fence;
mod manager;
mod memory;
mod metrics;

pub use backend::CacheBackend;
pub use manager::{CacheLookup, CacheManager, CacheTier, TierSettings, TieredConfig};
pub use memory::{BackendStats, InMemoryBackend};
pub use metrics::{LatencyTracker, TierMetrics, TierStats, TieredStats};
