//! Cache Eviction Policies
//!
//! A strategy inspects one shard (already under its exclusive lock) and
//! names a single victim. The shard removes it and reports progress.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::entry::EntryMetadata;
use crate::error::Error;

/// Victim selection over the entries of one shard
pub trait EvictionStrategy: Send + Sync + fmt::Debug {
    /// Name used in logs and stats
    fn name(&self) -> &'static str;

    /// Pick one key to evict, or `None` if no candidate can be chosen
    fn select_victim<'a>(
        &self,
        candidates: &mut dyn Iterator<Item = (&'a str, &'a EntryMetadata)>,
    ) -> Option<&'a str>;
}

/// Least-recently-used: minimum access tick
#[derive(Debug, Clone, Copy, Default)]
pub struct LruStrategy;

impl EvictionStrategy for LruStrategy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn select_victim<'a>(
        &self,
        candidates: &mut dyn Iterator<Item = (&'a str, &'a EntryMetadata)>,
    ) -> Option<&'a str> {
        candidates
            .min_by_key(|(_, meta)| meta.access_tick())
            .map(|(key, _)| key)
    }
}

/// Least-frequently-used: minimum access count, older ticks first on ties
#[derive(Debug, Clone, Copy, Default)]
pub struct LfuStrategy;

impl EvictionStrategy for LfuStrategy {
    fn name(&self) -> &'static str {
        "lfu"
    }

    fn select_victim<'a>(
        &self,
        candidates: &mut dyn Iterator<Item = (&'a str, &'a EntryMetadata)>,
    ) -> Option<&'a str> {
        candidates
            .min_by_key(|(_, meta)| (meta.access_count(), meta.access_tick()))
            .map(|(key, _)| key)
    }
}

/// Arbitrary victim in map iteration order, O(1)
#[derive(Debug, Clone, Copy, Default)]
pub struct UnorderedStrategy;

impl EvictionStrategy for UnorderedStrategy {
    fn name(&self) -> &'static str {
        "unordered"
    }

    fn select_victim<'a>(
        &self,
        candidates: &mut dyn Iterator<Item = (&'a str, &'a EntryMetadata)>,
    ) -> Option<&'a str> {
        candidates.next().map(|(key, _)| key)
    }
}

/// Built-in eviction policy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently used (default)
    #[default]
    Lru,
    /// Least frequently used
    Lfu,
    /// Arbitrary victim. Older configs call this "ttl".
    #[serde(alias = "ttl")]
    Unordered,
}

impl EvictionPolicy {
    /// Strategy object implementing this policy
    pub fn strategy(self) -> Arc<dyn EvictionStrategy> {
        match self {
            EvictionPolicy::Lru => Arc::new(LruStrategy),
            EvictionPolicy::Lfu => Arc::new(LfuStrategy),
            EvictionPolicy::Unordered => Arc::new(UnorderedStrategy),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EvictionPolicy::Lru => LruStrategy.name(),
            EvictionPolicy::Lfu => LfuStrategy.name(),
            EvictionPolicy::Unordered => UnorderedStrategy.name(),
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EvictionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "lfu" => Ok(EvictionPolicy::Lfu),
            "unordered" | "random" => Ok(EvictionPolicy::Unordered),
            "ttl" => {
                warn!("eviction policy \"ttl\" is deprecated, it evicts arbitrary entries; use \"unordered\"");
                Ok(EvictionPolicy::Unordered)
            }
            other => Err(Error::InvalidConfig(format!(
                "unknown eviction policy: {}",
                other
            ))),
        }
    }
}
