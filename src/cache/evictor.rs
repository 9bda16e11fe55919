//! Eviction policy: decides which entries leave a bounded tier.
//!
//! Victims are chosen least-recently-used first. A tier is over budget when
//! it holds more entries than its capacity or, with size accounting enabled,
//! more bytes than its byte budget.

use crate::cache::entry::CacheKey;

/// Capacity limits of one bounded tier (or one shard of it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionBudget {
    /// Maximum number of entries.
    pub capacity: usize,

    /// Maximum total `size_hint` bytes, if size accounting is enabled.
    pub max_bytes: Option<usize>,
}

impl EvictionBudget {
    pub fn new(capacity: usize, max_bytes: Option<usize>) -> Self {
        Self {
            capacity,
            max_bytes,
        }
    }

    /// Split a tier-wide budget evenly across `shards`, rounding up.
    pub fn per_shard(&self, shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            capacity: self.capacity.div_ceil(shards),
            max_bytes: self.max_bytes.map(|b| b.div_ceil(shards)),
        }
    }

    /// Whether a tier holding `len` entries and `bytes` bytes exceeds the budget.
    pub fn is_exceeded(&self, len: usize, bytes: usize) -> bool {
        len > self.capacity || self.max_bytes.is_some_and(|max| bytes > max)
    }

    /// Whether one more entry of `size` bytes fits without evicting.
    pub fn has_room_for(&self, len: usize, bytes: usize, size: usize) -> bool {
        !self.is_exceeded(len + 1, bytes + size)
    }
}

/// The eviction policy engine.
#[derive(Debug, Clone)]
pub struct Evictor {
    budget: EvictionBudget,
}

impl Evictor {
    pub fn new(budget: EvictionBudget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> EvictionBudget {
        self.budget
    }

    /// Select the entries to evict so the tier fits its budget again.
    ///
    /// `lru_order` must yield `(key, size)` from least to most recently used.
    /// The `protected` key (usually the entry just inserted) is never chosen.
    pub fn select_victims<'a>(
        &self,
        lru_order: impl Iterator<Item = (&'a CacheKey, usize)>,
        len: usize,
        bytes: usize,
        protected: Option<&CacheKey>,
    ) -> Vec<CacheKey> {
        let mut victims = Vec::new();
        let (mut len, mut bytes) = (len, bytes);

        for (key, size) in lru_order {
            if !self.budget.is_exceeded(len, bytes) {
                break;
            }
            if protected == Some(key) {
                continue;
            }
            victims.push(key.clone());
            len -= 1;
            bytes = bytes.saturating_sub(size);
        }

        victims
    }
}
