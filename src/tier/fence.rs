//! Write Fences
//!
//! Striped write generations that let a background promotion tell whether a
//! write or delete touched its key after the value was read.
//!
//! Writers hold a [`WriteFence`] for the whole fan-out. Entering and leaving
//! both bump the stripe generation, and the stripe counts writers in flight.
//! A reader takes a [`WriteMark`] before its first tier read; the mark is
//! only issued while no writer holds the stripe, and it stays valid only
//! while the generations are unchanged. Keys sharing a stripe cause spurious
//! invalidation, never a missed one.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::cache::ShardRouter;

/// Default number of key stripes
pub(crate) const DEFAULT_STRIPES: usize = 256;

#[derive(Debug, Default)]
struct Stripe {
    generation: AtomicU64,
    writers: AtomicU64,
}

impl Stripe {
    fn enter(&self) {
        self.writers.fetch_add(1, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.writers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Current generation, or `None` while a writer is inside
    fn observe(&self) -> Option<u64> {
        let generation = self.generation.load(Ordering::SeqCst);
        if self.writers.load(Ordering::SeqCst) > 0 {
            None
        } else {
            Some(generation)
        }
    }
}

/// Generations observed for one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WriteMark {
    key: u64,
    all: u64,
}

/// Held by a writer for the duration of its fan-out
#[must_use]
pub(crate) struct WriteFence<'a> {
    stripe: &'a Stripe,
}

impl Drop for WriteFence<'_> {
    fn drop(&mut self) {
        self.stripe.leave();
    }
}

/// Striped write generations for the tier manager
#[derive(Debug)]
pub(crate) struct WriteFences {
    router: ShardRouter,
    stripes: Box<[Stripe]>,
    /// Bumped by writes that cannot name their keys (tag invalidation)
    all: Stripe,
}

impl WriteFences {
    pub fn new(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            router: ShardRouter::new(stripes),
            stripes: (0..stripes).map(|_| Stripe::default()).collect(),
            all: Stripe::default(),
        }
    }

    fn stripe(&self, key: &str) -> &Stripe {
        &self.stripes[self.router.shard_for(key)]
    }

    /// Fence writes to one key
    pub fn fence(&self, key: &str) -> WriteFence<'_> {
        let stripe = self.stripe(key);
        stripe.enter();
        WriteFence { stripe }
    }

    /// Fence writes that may touch any key
    pub fn fence_all(&self) -> WriteFence<'_> {
        self.all.enter();
        WriteFence { stripe: &self.all }
    }

    /// Mark the key's generations, or `None` while a write is in flight
    pub fn mark(&self, key: &str) -> Option<WriteMark> {
        let all = self.all.observe()?;
        let key = self.stripe(key).observe()?;
        Some(WriteMark { key, all })
    }

    /// Whether no write to `key` started since `mark` was taken
    pub fn unchanged(&self, key: &str, mark: WriteMark) -> bool {
        self.mark(key) == Some(mark)
    }
}

impl Default for WriteFences {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}
