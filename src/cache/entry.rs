//! Cache Entry Types
//!
//! An entry owns its value and a block of access metadata. Everything a
//! reader touches on a hit is atomic, so hits are recorded under the shard's
//! shared lock without structural mutation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds elapsed on the process-wide monotonic cache clock
#[inline]
pub fn now_millis() -> u64 {
    CLOCK_EPOCH.elapsed().as_millis() as u64
}

/// Resolve an absolute expiry from a per-call TTL and the store default.
///
/// A non-zero `ttl` wins, then a non-zero `default_ttl`; otherwise the entry
/// never expires.
pub fn compute_expiry(now: Instant, ttl: Duration, default_ttl: Duration) -> Option<Instant> {
    if !ttl.is_zero() {
        now.checked_add(ttl)
    } else if !default_ttl.is_zero() {
        now.checked_add(default_ttl)
    } else {
        None
    }
}

/// Access metadata for a cache entry
#[derive(Debug)]
pub struct EntryMetadata {
    /// Absolute expiry (None = never)
    expires_at: Option<Instant>,
    /// Insertion time
    created_at: Instant,
    /// Last access, in milliseconds on the cache clock
    access_time: AtomicU64,
    /// Shard-local logical clock value of the last access
    access_tick: AtomicU64,
    /// Successful reads
    access_count: AtomicU64,
    /// Set once the expiry has been counted, so lazy and swept removals
    /// do not count the same entry twice
    expiry_recorded: AtomicBool,
}

impl EntryMetadata {
    /// Create metadata for a freshly inserted entry
    pub fn new(expires_at: Option<Instant>, tick: u64) -> Self {
        Self {
            expires_at,
            created_at: Instant::now(),
            access_time: AtomicU64::new(now_millis()),
            access_tick: AtomicU64::new(tick),
            access_count: AtomicU64::new(0),
            expiry_recorded: AtomicBool::new(false),
        }
    }

    /// Record a read and return the new access count
    #[inline]
    pub fn record_access(&self, tick: u64) -> u64 {
        self.access_time.store(now_millis(), Ordering::Relaxed);
        self.access_tick.fetch_max(tick, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Refresh recency without counting a read
    #[inline]
    pub fn touch(&self, tick: u64) {
        self.access_time.store(now_millis(), Ordering::Relaxed);
        self.access_tick.fetch_max(tick, Ordering::Relaxed);
    }

    #[inline]
    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn access_tick(&self) -> u64 {
        self.access_tick.load(Ordering::Relaxed)
    }

    /// Last access time in milliseconds on the cache clock
    #[inline]
    pub fn access_time(&self) -> u64 {
        self.access_time.load(Ordering::Relaxed)
    }

    /// Time since the last access
    pub fn idle_for(&self) -> Duration {
        Duration::from_millis(now_millis().saturating_sub(self.access_time()))
    }

    #[inline]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    #[inline]
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub(crate) fn set_expires_at(&mut self, expires_at: Option<Instant>) {
        self.expires_at = expires_at;
        self.expiry_recorded.store(false, Ordering::Relaxed);
    }

    /// Check expiry against a caller-supplied instant
    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }

    /// Check if entry has expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Remaining lifetime, `None` for entries that never expire
    pub fn remaining_ttl(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }

    /// Mark the expiry as counted; true only for the first caller
    #[inline]
    pub(crate) fn claim_expiry(&self) -> bool {
        !self.expiry_recorded.swap(true, Ordering::Relaxed)
    }
}

/// Cache entry containing a value, its tags and metadata
#[derive(Debug)]
pub struct CacheEntry<V> {
    value: V,
    /// Sorted, de-duplicated tag set
    tags: Vec<String>,
    pub metadata: EntryMetadata,
}

impl<V> CacheEntry<V> {
    /// Create a new entry. Duplicate tags are collapsed.
    pub fn new(value: V, tags: &[String], expires_at: Option<Instant>, tick: u64) -> Self {
        let mut tags = tags.to_vec();
        tags.sort_unstable();
        tags.dedup();
        Self {
            value,
            tags,
            metadata: EntryMetadata::new(expires_at, tick),
        }
    }

    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }

    #[inline]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.binary_search_by(|t| t.as_str().cmp(tag)).is_ok()
    }

    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.metadata.is_expired_at(now)
    }

    pub fn into_value(self) -> V {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_compute_expiry_precedence() {
        let now = Instant::now();
        let explicit = compute_expiry(now, Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(explicit, Some(now + Duration::from_secs(5)));

        let fallback = compute_expiry(now, Duration::ZERO, Duration::from_secs(60));
        assert_eq!(fallback, Some(now + Duration::from_secs(60)));

        assert_eq!(compute_expiry(now, Duration::ZERO, Duration::ZERO), None);
    }

    #[test]
    fn test_entry_tags_are_deduplicated() {
        let entry = CacheEntry::new(1u32, &tags(&["user", "post", "user"]), None, 0);
        assert_eq!(entry.tags(), &["post".to_string(), "user".to_string()]);
        assert!(entry.has_tag("user"));
        assert!(!entry.has_tag("comment"));
    }

    #[test]
    fn test_access_tracking() {
        let entry = CacheEntry::new("v", &[], None, 1);
        assert_eq!(entry.metadata.access_count(), 0);
        assert_eq!(entry.metadata.record_access(7), 1);
        assert_eq!(entry.metadata.record_access(9), 2);
        assert_eq!(entry.metadata.access_tick(), 9);

        // Ticks never move backwards
        entry.metadata.touch(3);
        assert_eq!(entry.metadata.access_tick(), 9);
        assert_eq!(entry.metadata.access_count(), 2);
    }

    #[test]
    fn test_expiry() {
        let now = Instant::now();
        let entry = CacheEntry::new((), &[], Some(now + Duration::from_millis(50)), 0);
        assert!(!entry.is_expired_at(now));
        assert!(entry.is_expired_at(now + Duration::from_millis(50)));
        assert_eq!(
            entry.metadata.remaining_ttl(now),
            Some(Duration::from_millis(50))
        );

        let forever = CacheEntry::new((), &[], None, 0);
        assert!(!forever.is_expired_at(now + Duration::from_secs(86400)));
        assert_eq!(forever.metadata.remaining_ttl(now), None);
    }

    #[test]
    fn test_expiry_claimed_once() {
        let mut entry = CacheEntry::new((), &[], Some(Instant::now()), 0);
        assert!(entry.metadata.claim_expiry());
        assert!(!entry.metadata.claim_expiry());

        entry.metadata.set_expires_at(None);
        assert!(entry.metadata.claim_expiry());
    }
}
