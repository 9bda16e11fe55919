//! Bounded in-memory tier with least-recently-used eviction.

use std::collections::{BTreeMap, HashMap};

use crate::cache::entry::{CacheEntry, CacheKey, CacheValue, Tier};
use crate::cache::evictor::{EvictionBudget, Evictor};

/// One bounded tier (or one shard of it).
///
/// `order` indexes entries by their logical access tick, so the first
/// element is always the least recently used entry.
#[derive(Debug)]
pub struct LruTier<V> {
    tier: Tier,
    entries: HashMap<CacheKey, CacheEntry<V>>,
    order: BTreeMap<u64, CacheKey>,
    bytes_used: usize,
    evictor: Evictor,
}

impl<V: CacheValue> LruTier<V> {
    pub fn new(tier: Tier, budget: EvictionBudget) -> Self {
        Self {
            tier,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            bytes_used: 0,
            evictor: Evictor::new(budget),
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn budget(&self) -> EvictionBudget {
        self.evictor.budget()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn peek(&self, key: &CacheKey) -> Option<&CacheEntry<V>> {
        self.entries.get(key)
    }

    /// Whether an entry of `size` bytes can be added without evicting.
    pub fn has_room_for(&self, size: usize) -> bool {
        self.evictor
            .budget()
            .has_room_for(self.entries.len(), self.bytes_used, size)
    }

    /// Mark `key` as most recently used and return it.
    pub fn touch(&mut self, key: &CacheKey) -> Option<&CacheEntry<V>> {
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.access_tick);
        entry.touch();
        self.order.insert(entry.access_tick, key.clone());
        Some(entry)
    }

    /// Insert an entry, replacing any previous value for its key.
    ///
    /// Returns the entries evicted to make room, least recently used first.
    pub fn insert(&mut self, mut entry: CacheEntry<V>) -> Vec<CacheEntry<V>> {
        self.remove(&entry.key);

        entry.tier = self.tier;
        let key = entry.key.clone();
        self.bytes_used += entry.size_hint;
        self.order.insert(entry.access_tick, key.clone());
        self.entries.insert(key.clone(), entry);

        let victims = self.evictor.select_victims(
            self.order
                .values()
                .map(|k| (k, self.entries.get(k).map_or(0, |e| e.size_hint))),
            self.entries.len(),
            self.bytes_used,
            Some(&key),
        );

        victims.iter().filter_map(|k| self.remove(k)).collect()
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.access_tick);
        self.bytes_used = self.bytes_used.saturating_sub(entry.size_hint);
        Some(entry)
    }

    /// Remove every entry whose key matches `predicate`.
    pub fn remove_matching(&mut self, predicate: &dyn Fn(&CacheKey) -> bool) -> usize {
        let doomed: Vec<CacheKey> = self.entries.keys().filter(|k| predicate(k)).cloned().collect();
        doomed.iter().filter(|k| self.remove(k).is_some()).count()
    }

    /// Keys from least to most recently used.
    pub fn lru_keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.order.values()
    }
}
