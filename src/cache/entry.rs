//! Cache keys, values, entries and tier definitions.
//!
//! An entry is the unit of movement between tiers: it is promoted, demoted
//! and evicted as a whole and lives in exactly one tier at a time.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifies which tier an entry currently resides in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    /// Tier 0: small, fastest.
    Hot,
    /// Tier 1: larger in-memory tier.
    Warm,
    /// Tier 2: unbounded, network-backed.
    Cold,
}

impl Tier {
    /// Returns the numeric tier level (lower = faster).
    pub fn level(&self) -> u8 {
        match self {
            Tier::Hot => 0,
            Tier::Warm => 1,
            Tier::Cold => 2,
        }
    }

    /// Returns the next slower tier for eviction, or None if already coldest.
    pub fn demote(&self) -> Option<Tier> {
        match self {
            Tier::Hot => Some(Tier::Warm),
            Tier::Warm => Some(Tier::Cold),
            Tier::Cold => None,
        }
    }

    /// Whether this tier has a capacity bound and an eviction policy.
    pub fn is_bounded(&self) -> bool {
        !matches!(self, Tier::Cold)
    }

    /// Lowercase name, also used as a metrics label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque, immutable fingerprint identifying a cached result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Wrap an already-computed fingerprint.
    pub fn new(fingerprint: impl AsRef<str>) -> Self {
        Self(Arc::from(fingerprint.as_ref()))
    }

    /// Derive a key from an operation name and its arguments.
    ///
    /// The result is `"{operation}:{16 hex chars}"` and is stable across
    /// processes, so it can address the shared cold store.
    pub fn derive<S: AsRef<str>>(operation: &str, args: &[S]) -> Self {
        let mut hasher = Sha256::new();
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                hasher.update([0x1f]);
            }
            hasher.update(arg.as_ref().as_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        Self::new(format!("{operation}:{}", &digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Portion before the first `:`, used for category invalidation.
    pub fn category(&self) -> &str {
        self.0.split_once(':').map(|(c, _)| c).unwrap_or(&self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// A value the cache can hold in every tier.
///
/// Serialization is required because the cold tier stores bytes.
pub trait CacheValue: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Approximate in-memory size used for byte budgets.
    fn size_hint(&self) -> usize {
        std::mem::size_of_val(self)
    }
}

impl CacheValue for String {
    fn size_hint(&self) -> usize {
        self.len()
    }
}

impl CacheValue for Vec<u8> {
    fn size_hint(&self) -> usize {
        self.len()
    }
}

impl CacheValue for bytes::Bytes {
    fn size_hint(&self) -> usize {
        self.len()
    }
}

impl CacheValue for serde_json::Value {
    fn size_hint(&self) -> usize {
        match self {
            serde_json::Value::String(s) => s.len(),
            serde_json::Value::Array(items) => items.iter().map(CacheValue::size_hint).sum(),
            serde_json::Value::Object(map) => {
                map.iter().map(|(k, v)| k.len() + v.size_hint()).sum()
            }
            _ => std::mem::size_of::<serde_json::Value>(),
        }
    }
}

/// Global logical clock ordering accesses. Strictly increasing, so two
/// accesses never tie even when `Instant::now()` does.
static ACCESS_CLOCK: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_tick() -> u64 {
    ACCESS_CLOCK.fetch_add(1, Ordering::Relaxed)
}

/// A single cached value with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: CacheKey,

    pub value: V,

    /// Current storage tier.
    pub tier: Tier,

    /// Wall-clock time of the last access.
    pub last_access: Instant,

    /// When the value was first written to the cache.
    pub inserted_at: Instant,

    /// Logical recency stamp; the smallest tick in a tier is its LRU entry.
    pub access_tick: u64,

    /// Number of hits served from this entry.
    pub access_count: u64,

    /// Size in bytes as reported by [`CacheValue::size_hint`].
    pub size_hint: usize,
}

impl<V: CacheValue> CacheEntry<V> {
    pub fn new(key: CacheKey, value: V, tier: Tier) -> Self {
        let now = Instant::now();
        let size_hint = value.size_hint();
        Self {
            key,
            value,
            tier,
            last_access: now,
            inserted_at: now,
            access_tick: next_tick(),
            access_count: 0,
            size_hint,
        }
    }

    /// Rebuild an entry read back from the cold tier, keeping its original age.
    pub fn restored(key: CacheKey, value: V, inserted_at: Instant) -> Self {
        let mut entry = Self::new(key, value, Tier::Cold);
        entry.inserted_at = inserted_at;
        entry
    }
}

impl<V> CacheEntry<V> {
    /// Record an access, updating timestamp, recency and counter.
    pub fn touch(&mut self) {
        self.last_access = Instant::now();
        self.access_tick = next_tick();
        self.access_count += 1;
    }

    /// Whether the entry is older than `ttl`.
    pub fn is_expired(&self, ttl: Option<std::time::Duration>, now: Instant) -> bool {
        ttl.is_some_and(|ttl| now.saturating_duration_since(self.inserted_at) >= ttl)
    }
}
