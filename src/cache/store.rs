//! Tiered cache store: Hot → Warm → Cold.
//!
//! The store is the central index for cached values. It:
//! - Looks keys up in fixed tier order, stopping at the first hit
//! - Promotes Warm/Cold hits into Hot, demoting Hot's LRU entry to make room
//! - Demotes Warm's LRU entries into the Cold tier on eviction
//! - Absorbs every Cold tier failure, degrading it to a miss or no-op
//!
//! Hot and Warm are split into key-hash shards. Each shard keeps its slice
//! of both tiers behind one mutex, so a Hot/Warm move is never observed
//! half-done. An entry is always removed from its source tier before it is
//! inserted into the destination tier.
//!
//! Cold writes run outside the shard lock. Each one takes a ticket under the
//! lock; re-caching or invalidating the key voids the ticket, and a write
//! that lands with a void ticket deletes its own copy.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::cold::ColdStore;
use crate::cache::compressor::{ColdRecord, Compressor};
use crate::cache::entry::{CacheEntry, CacheKey, CacheValue, Tier};
use crate::cache::evictor::EvictionBudget;
use crate::cache::tier::LruTier;
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::metrics::CacheMetrics;

/// A successful lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup<V> {
    pub value: V,
    /// Tier the value was found in (before any promotion).
    pub tier: Tier,
}

/// Per-tier usage statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierStats {
    pub tier: Tier,
    /// Number of entries in this tier.
    pub entries: usize,
    /// Total `size_hint` bytes in this tier.
    pub bytes_used: usize,
    /// Entry capacity, `None` for the unbounded cold tier.
    pub capacity: Option<usize>,
    pub max_bytes: Option<usize>,
}

impl TierStats {
    /// Usage as a fraction of entry capacity (0.0 - 1.0).
    pub fn usage_fraction(&self) -> f64 {
        match self.capacity {
            Some(cap) if cap > 0 => self.entries as f64 / cap as f64,
            _ => 0.0,
        }
    }
}

struct Shard<V> {
    hot: LruTier<V>,
    warm: LruTier<V>,
}

impl<V: CacheValue> Shard<V> {
    fn tier_mut(&mut self, tier: Tier) -> &mut LruTier<V> {
        match tier {
            Tier::Hot => &mut self.hot,
            _ => &mut self.warm,
        }
    }
}

/// The tiered cache store.
pub struct CacheStore<V> {
    shards: Vec<Mutex<Shard<V>>>,
    hot_budget: EvictionBudget,
    warm_budget: EvictionBudget,
    cold: Arc<dyn ColdStore>,
    /// Keys this process has written to the cold tier and not removed.
    cold_keys: DashSet<CacheKey>,
    /// Latest ticket of each cold write still in flight.
    pending_cold: DashMap<CacheKey, u64>,
    cold_tickets: AtomicU64,
    compressor: Compressor,
    cold_timeout: Duration,
    ttl: Option<Duration>,
    metrics: Arc<CacheMetrics>,
}

impl<V: CacheValue> CacheStore<V> {
    pub fn new(config: &Config, cold: Arc<dyn ColdStore>, metrics: Arc<CacheMetrics>) -> Self {
        let shard_count = config.tiers.shards.max(1);
        let hot_budget = EvictionBudget::new(config.tiers.hot_capacity, config.tiers.hot_max_bytes);
        let warm_budget =
            EvictionBudget::new(config.tiers.warm_capacity, config.tiers.warm_max_bytes);

        let shards = (0..shard_count)
            .map(|_| {
                Mutex::new(Shard {
                    hot: LruTier::new(Tier::Hot, hot_budget.per_shard(shard_count)),
                    warm: LruTier::new(Tier::Warm, warm_budget.per_shard(shard_count)),
                })
            })
            .collect();

        Self {
            shards,
            hot_budget,
            warm_budget,
            cold,
            cold_keys: DashSet::new(),
            pending_cold: DashMap::new(),
            cold_tickets: AtomicU64::new(0),
            compressor: Compressor::new(&config.cold),
            cold_timeout: config.cold.op_timeout(),
            ttl: config.tiers.entry_ttl(),
            metrics,
        }
    }

    fn shard(&self, key: &CacheKey) -> &Mutex<Shard<V>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Look `key` up in Hot, then Warm, then Cold.
    ///
    /// A hit refreshes the entry's access time; nothing moves between tiers.
    pub async fn get(&self, key: &CacheKey) -> Option<Lookup<V>> {
        if let Some(found) = self.memory_lookup(key, false) {
            return Some(found);
        }
        let (value, _) = self.cold_lookup(key).await?;
        Some(Lookup {
            value,
            tier: Tier::Cold,
        })
    }

    /// Look `key` up and promote a Warm or Cold hit into Hot.
    pub async fn get_and_promote(&self, key: &CacheKey) -> Option<Lookup<V>> {
        if let Some(found) = self.memory_lookup(key, true) {
            return Some(found);
        }
        let (value, inserted_at) = self.cold_lookup(key).await?;
        self.promote_from_cold(key, value.clone(), inserted_at).await;
        Some(Lookup {
            value,
            tier: Tier::Cold,
        })
    }

    /// Move a Warm or Cold entry into Hot. A Hot entry only has its access
    /// time refreshed. Returns whether the key is now in Hot.
    pub async fn promote(&self, key: &CacheKey) -> bool {
        {
            let mut shard = self.shard(key).lock();
            if shard.hot.touch(key).is_some() {
                return true;
            }
            if let Some(entry) = shard.warm.remove(key) {
                self.metrics.promotions.with_label_values(&["warm"]).inc();
                self.place_in_hot(&mut shard, entry);
                return true;
            }
        }

        match self.cold_lookup_quiet(key).await {
            Some((value, inserted_at)) => self.promote_from_cold(key, value, inserted_at).await,
            None => false,
        }
    }

    /// Insert `value` into `tier`, evicting that tier's LRU entry if full.
    pub async fn put(&self, key: CacheKey, value: V, tier: Tier) {
        if tier == Tier::Cold {
            let ticket = {
                let mut shard = self.shard(&key).lock();
                shard.remove_everywhere(&key);
                self.begin_cold_write(&key)
            };
            let entry = CacheEntry::new(key, value, Tier::Cold);
            let stored = self.write_cold(&entry).await;
            self.settle_cold_write(&entry.key, ticket, stored).await;
            return;
        }

        // Source tier first: drop any cold copy before the key appears in memory.
        if self.cold_keys.contains(&key) {
            self.delete_cold(&key).await;
        }

        let entry = CacheEntry::new(key.clone(), value, tier);
        let (to_cold, cold_copy_left) = {
            let mut shard = self.shard(&key).lock();
            shard.remove_everywhere(&key);
            let cold_copy_left = self.claim_for_memory(&key);
            let victims = match tier {
                Tier::Hot => {
                    self.place_in_hot(&mut shard, entry);
                    Vec::new()
                }
                _ => shard.warm.insert(entry),
            };
            let to_cold: Vec<_> = victims
                .into_iter()
                .map(|victim| {
                    let ticket = self.begin_cold_write(&victim.key);
                    (victim, ticket)
                })
                .collect();
            (to_cold, cold_copy_left)
        };

        // A cold write for this key settled between the check above and the insert.
        if cold_copy_left {
            self.delete_cold(&key).await;
        }
        self.demote_to_cold(to_cold).await;
    }

    /// Remove every entry, in every tier, whose key matches `predicate`.
    pub async fn invalidate<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CacheKey) -> bool + Send + Sync,
    {
        let mut removed = 0;
        for shard in &self.shards {
            removed += shard.lock().remove_matching(&predicate);
        }
        self.pending_cold.retain(|k, _| !predicate(k));

        if let Some(keys) = self.cold_call("keys", self.cold.keys()).await {
            for key in keys.into_iter().filter(|k| predicate(k)) {
                if self.delete_cold(&key).await {
                    removed += 1;
                }
            }
        }
        self.cold_keys.retain(|k| !predicate(k));

        debug!(removed, "Invalidated entries");
        removed
    }

    /// Return a value even if its TTL has passed. Used for stale-if-error
    /// fallbacks when fresh data cannot be fetched.
    pub async fn get_stale(&self, key: &CacheKey) -> Option<V> {
        {
            let shard = self.shard(key).lock();
            if let Some(entry) = shard.hot.peek(key).or_else(|| shard.warm.peek(key)) {
                return Some(entry.value.clone());
            }
        }
        let payload = self.cold_call("get", self.cold.get(key)).await??;
        self.decode(key, &payload).map(|record| record.value)
    }

    /// In-memory tier holding `key`, without touching it. Never calls the cold tier.
    pub fn memory_tier_of(&self, key: &CacheKey) -> Option<Tier> {
        let shard = self.shard(key).lock();
        if shard.hot.contains(key) {
            Some(Tier::Hot)
        } else if shard.warm.contains(key) {
            Some(Tier::Warm)
        } else {
            None
        }
    }

    /// Every tier currently holding `key`. Exclusivity means at most one.
    pub async fn locate(&self, key: &CacheKey) -> Vec<Tier> {
        let mut tiers = Vec::new();
        {
            let shard = self.shard(key).lock();
            if shard.hot.contains(key) {
                tiers.push(Tier::Hot);
            }
            if shard.warm.contains(key) {
                tiers.push(Tier::Warm);
            }
        }
        if let Some(Some(_)) = self.cold_call("get", self.cold.get(key)).await {
            tiers.push(Tier::Cold);
        }
        tiers
    }

    pub fn stats(&self) -> Vec<TierStats> {
        let (mut hot, mut warm) = ((0, 0), (0, 0));
        for shard in &self.shards {
            let shard = shard.lock();
            hot.0 += shard.hot.len();
            hot.1 += shard.hot.bytes_used();
            warm.0 += shard.warm.len();
            warm.1 += shard.warm.bytes_used();
        }

        vec![
            TierStats {
                tier: Tier::Hot,
                entries: hot.0,
                bytes_used: hot.1,
                capacity: Some(self.hot_budget.capacity),
                max_bytes: self.hot_budget.max_bytes,
            },
            TierStats {
                tier: Tier::Warm,
                entries: warm.0,
                bytes_used: warm.1,
                capacity: Some(self.warm_budget.capacity),
                max_bytes: self.warm_budget.max_bytes,
            },
            TierStats {
                tier: Tier::Cold,
                entries: self.cold_keys.len(),
                bytes_used: 0,
                capacity: None,
                max_bytes: None,
            },
        ]
    }

    // ─── Internals ──────────────────────────────────────────────────────────

    fn memory_lookup(&self, key: &CacheKey, promote: bool) -> Option<Lookup<V>> {
        let now = Instant::now();
        let mut shard = self.shard(key).lock();

        for tier in [Tier::Hot, Tier::Warm] {
            let lru = shard.tier_mut(tier);
            let expired = match lru.peek(key) {
                Some(entry) => entry.is_expired(self.ttl, now),
                None => continue,
            };
            if expired {
                lru.remove(key);
                self.metrics.expirations.inc();
                debug!(key = %key, tier = %tier, "Expired entry dropped");
                break;
            }

            self.metrics.hits.with_label_values(&[tier.as_str()]).inc();
            let value = lru.touch(key)?.value.clone();

            if promote && tier == Tier::Warm {
                if let Some(entry) = shard.warm.remove(key) {
                    self.metrics.promotions.with_label_values(&["warm"]).inc();
                    self.place_in_hot(&mut shard, entry);
                }
            }
            return Some(Lookup { value, tier });
        }

        None
    }

    async fn cold_lookup(&self, key: &CacheKey) -> Option<(V, Instant)> {
        let found = self.cold_lookup_quiet(key).await;
        match found {
            Some(_) => self.metrics.hits.with_label_values(&["cold"]).inc(),
            None => self.metrics.misses.inc(),
        }
        found
    }

    async fn cold_lookup_quiet(&self, key: &CacheKey) -> Option<(V, Instant)> {
        let payload = self.cold_call("get", self.cold.get(key)).await??;
        let record = self.decode(key, &payload)?;
        let age_ms = unix_now_ms().saturating_sub(record.inserted_at_ms);
        if self
            .ttl
            .is_some_and(|ttl| u128::from(age_ms) >= ttl.as_millis())
        {
            // Kept in place for get_stale.
            return None;
        }
        Some((record.value, instant_from_unix_ms(record.inserted_at_ms)))
    }

    async fn promote_from_cold(&self, key: &CacheKey, value: V, inserted_at: Instant) -> bool {
        let deleted = self.cold_call("delete", self.cold.delete(key)).await;
        self.cold_keys.remove(key);
        if deleted.is_none() {
            // The cold copy may still exist; keep the single copy where it is.
            return false;
        }

        let mut entry = CacheEntry::restored(key.clone(), value, inserted_at);
        entry.touch();
        let cold_copy_left = {
            let mut shard = self.shard(key).lock();
            shard.remove_everywhere(key);
            let cold_copy_left = self.claim_for_memory(key);
            self.metrics.promotions.with_label_values(&["cold"]).inc();
            self.place_in_hot(&mut shard, entry);
            cold_copy_left
        };
        if cold_copy_left {
            self.delete_cold(key).await;
        }
        true
    }

    /// Call under the key's shard lock before `key` enters memory. Voids any
    /// in-flight cold write for it and reports whether a cold copy is known.
    fn claim_for_memory(&self, key: &CacheKey) -> bool {
        self.pending_cold.remove(key);
        self.cold_keys.contains(key)
    }

    /// Call under the key's shard lock once the key has left memory.
    fn begin_cold_write(&self, key: &CacheKey) -> u64 {
        let ticket = self.cold_tickets.fetch_add(1, Ordering::Relaxed);
        self.pending_cold.insert(key.clone(), ticket);
        ticket
    }

    /// Publish a finished cold write. Returns false if the ticket was voided
    /// meanwhile; a copy written under a void ticket is deleted.
    async fn settle_cold_write(&self, key: &CacheKey, ticket: u64, stored: bool) -> bool {
        let current = {
            let _shard = self.shard(key).lock();
            let current = self
                .pending_cold
                .remove_if(key, |_, pending| *pending == ticket)
                .is_some();
            if current && stored {
                self.cold_keys.insert(key.clone());
            }
            current
        };

        if stored && !current {
            debug!(key = %key, "Cold write superseded, removing its copy");
            self.delete_cold(key).await;
        }
        current
    }

    /// Insert into Hot; Hot's victims move to Warm while Warm has room and
    /// are dropped otherwise.
    fn place_in_hot(&self, shard: &mut Shard<V>, entry: CacheEntry<V>) {
        for victim in shard.hot.insert(entry) {
            if shard.warm.has_room_for(victim.size_hint) {
                debug!(key = %victim.key, "Demoted hot entry to warm");
                self.metrics.demotions.with_label_values(&["warm"]).inc();
                shard.warm.insert(victim);
            } else {
                debug!(key = %victim.key, "Warm tier full, dropped hot victim");
                self.metrics.evictions.with_label_values(&["hot"]).inc();
            }
        }
    }

    async fn demote_to_cold(&self, victims: Vec<(CacheEntry<V>, u64)>) {
        for (victim, ticket) in victims {
            let stored = self.write_cold(&victim).await;
            if self.settle_cold_write(&victim.key, ticket, stored).await && stored {
                debug!(key = %victim.key, "Demoted warm entry to cold");
                self.metrics.demotions.with_label_values(&["cold"]).inc();
            } else {
                self.metrics.evictions.with_label_values(&["warm"]).inc();
            }
        }
    }

    async fn write_cold(&self, entry: &CacheEntry<V>) -> bool {
        let record = ColdRecord {
            inserted_at_ms: unix_ms_from_instant(entry.inserted_at),
            value: &entry.value,
        };
        let payload = match self.compressor.encode(&record) {
            Ok(p) => p,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "Failed to encode cold entry");
                return false;
            }
        };

        self.cold_call("put", self.cold.put(&entry.key, payload))
            .await
            .is_some()
    }

    async fn delete_cold(&self, key: &CacheKey) -> bool {
        let deleted = self
            .cold_call("delete", self.cold.delete(key))
            .await
            .unwrap_or(false);
        self.cold_keys.remove(key);
        deleted
    }

    fn decode(&self, key: &CacheKey, payload: &[u8]) -> Option<ColdRecord<V>> {
        match self.compressor.decode(payload) {
            Ok(record) => Some(record),
            Err(e) => {
                self.absorb(
                    "decode",
                    &CacheError::StoreUnavailable {
                        op: "decode",
                        reason: format!("{key}: {e}"),
                    },
                );
                None
            }
        }
    }

    /// Run one cold-store call under the cold timeout; failures become `None`.
    async fn cold_call<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Option<T> {
        match tokio::time::timeout(self.cold_timeout, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.absorb(op, &e);
                None
            }
            Err(_) => {
                self.absorb(
                    op,
                    &CacheError::StoreUnavailable {
                        op,
                        reason: format!("timed out after {:?}", self.cold_timeout),
                    },
                );
                None
            }
        }
    }

    fn absorb(&self, op: &'static str, err: &CacheError) {
        self.metrics.store_unavailable.with_label_values(&[op]).inc();
        warn!(op, error = %err, "Cold tier unavailable, degrading");
    }
}

impl<V: CacheValue> Shard<V> {
    fn remove_everywhere(&mut self, key: &CacheKey) {
        self.hot.remove(key);
        self.warm.remove(key);
    }

    fn remove_matching(&mut self, predicate: &dyn Fn(&CacheKey) -> bool) -> usize {
        self.hot.remove_matching(predicate) + self.warm.remove_matching(predicate)
    }
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn unix_ms_from_instant(at: Instant) -> u64 {
    unix_now_ms().saturating_sub(at.elapsed().as_millis() as u64)
}

fn instant_from_unix_ms(ms: u64) -> Instant {
    let age = Duration::from_millis(unix_now_ms().saturating_sub(ms));
    Instant::now().checked_sub(age).unwrap_or_else(Instant::now)
}
