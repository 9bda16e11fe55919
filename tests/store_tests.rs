//! Integration tests for the tiered cache store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use predictive_cache::cache::cold::{ColdStore, FileColdStore, InMemoryColdStore};
use predictive_cache::cache::entry::{CacheKey, Tier};
use predictive_cache::cache::store::CacheStore;
use predictive_cache::config::Config;
use predictive_cache::error::Result;
use predictive_cache::metrics::CacheMetrics;

struct Fixture {
    store: CacheStore<String>,
    cold: Arc<InMemoryColdStore>,
    metrics: Arc<CacheMetrics>,
}

fn fixture(hot: usize, warm: usize) -> Fixture {
    let mut config = Config::default();
    config.tiers.hot_capacity = hot;
    config.tiers.warm_capacity = warm;
    config.tiers.shards = 1;
    let cold = Arc::new(InMemoryColdStore::new());
    let metrics = Arc::new(CacheMetrics::new().unwrap());
    Fixture {
        store: CacheStore::new(&config, cold.clone(), metrics.clone()),
        cold,
        metrics,
    }
}

fn key(s: &str) -> CacheKey {
    CacheKey::new(s)
}

#[tokio::test]
async fn test_round_trip_every_tier() {
    let f = fixture(4, 4);
    for (name, tier) in [("h", Tier::Hot), ("w", Tier::Warm), ("c", Tier::Cold)] {
        f.store.put(key(name), format!("v-{name}"), tier).await;
        let found = f.store.get(&key(name)).await.unwrap();
        assert_eq!(found.value, format!("v-{name}"));
        assert_eq!(found.tier, tier);
    }
}

#[tokio::test]
async fn test_hot_capacity_two_scenario() {
    let f = fixture(2, 4);
    f.store.put(key("A"), "a".into(), Tier::Hot).await;
    f.store.put(key("B"), "b".into(), Tier::Hot).await;
    f.store.put(key("C"), "c".into(), Tier::Hot).await;

    // Warm has room, so A is demoted rather than dropped.
    assert_eq!(f.store.memory_tier_of(&key("A")), Some(Tier::Warm));
    assert_eq!(f.store.memory_tier_of(&key("B")), Some(Tier::Hot));
    assert_eq!(f.store.memory_tier_of(&key("C")), Some(Tier::Hot));
}

#[tokio::test]
async fn test_lru_evicts_first_inserted() {
    let capacity = 5;
    let f = fixture(capacity, capacity);
    for i in 1..=capacity + 1 {
        f.store.put(key(&format!("k{i}")), i.to_string(), Tier::Warm).await;
    }

    // k1 left Warm for Cold; everything else is still in Warm.
    assert_eq!(f.store.memory_tier_of(&key("k1")), None);
    assert_eq!(f.store.locate(&key("k1")).await, vec![Tier::Cold]);
    for i in 2..=capacity + 1 {
        assert_eq!(f.store.memory_tier_of(&key(&format!("k{i}"))), Some(Tier::Warm));
    }
}

#[tokio::test]
async fn test_access_protects_from_eviction() {
    let f = fixture(2, 2);
    f.store.put(key("a"), "a".into(), Tier::Warm).await;
    f.store.put(key("b"), "b".into(), Tier::Warm).await;
    f.store.get(&key("a")).await.unwrap();
    f.store.put(key("c"), "c".into(), Tier::Warm).await;

    assert_eq!(f.store.memory_tier_of(&key("a")), Some(Tier::Warm));
    assert_eq!(f.store.memory_tier_of(&key("b")), None);
    assert_eq!(f.cold.len(), 1);
}

#[tokio::test]
async fn test_promotion_happens_once() {
    let f = fixture(4, 4);
    f.store.put(key("k"), "v".into(), Tier::Warm).await;

    for _ in 0..3 {
        assert_eq!(f.store.get_and_promote(&key("k")).await.unwrap().value, "v");
    }

    assert_eq!(f.store.memory_tier_of(&key("k")), Some(Tier::Hot));
    assert_eq!(f.metrics.promotions.with_label_values(&["warm"]).get(), 1);
    assert_eq!(f.metrics.hits.with_label_values(&["warm"]).get(), 1);
    assert_eq!(f.metrics.hits.with_label_values(&["hot"]).get(), 2);
}

#[tokio::test]
async fn test_tier_exclusivity_under_churn() {
    let f = fixture(2, 3);
    let keys: Vec<CacheKey> = (0..8).map(|i| key(&format!("k{i}"))).collect();

    for step in 0..64usize {
        let k = &keys[(step * 5 + step / 3) % keys.len()];
        match step % 4 {
            0 => f.store.put(k.clone(), step.to_string(), Tier::Hot).await,
            1 => f.store.put(k.clone(), step.to_string(), Tier::Warm).await,
            2 => {
                f.store.get_and_promote(k).await;
            }
            _ => {
                f.store.promote(k).await;
            }
        }

        for k in &keys {
            let tiers = f.store.locate(k).await;
            assert!(tiers.len() <= 1, "step {step}: {k} in {tiers:?}");
        }
    }
}

#[tokio::test]
async fn test_byte_budget_evicts() {
    let mut config = Config::default();
    config.tiers.shards = 1;
    config.tiers.hot_capacity = 100;
    config.tiers.hot_max_bytes = Some(10);
    let cold = Arc::new(InMemoryColdStore::new());
    let store: CacheStore<String> =
        CacheStore::new(&config, cold, Arc::new(CacheMetrics::new().unwrap()));

    store.put(key("a"), "aaaaaa".into(), Tier::Hot).await;
    store.put(key("b"), "bbbbbb".into(), Tier::Hot).await;

    assert_eq!(store.memory_tier_of(&key("a")), Some(Tier::Warm));
    assert_eq!(store.memory_tier_of(&key("b")), Some(Tier::Hot));
    assert!(store.stats()[0].bytes_used <= 10);
}

#[tokio::test]
async fn test_cold_outage_degrades_to_miss() {
    let f = fixture(1, 1);
    f.store.put(key("a"), "a".into(), Tier::Warm).await;
    f.cold.set_available(false);

    // Warm overflow cannot reach Cold: the victim is dropped, not an error.
    f.store.put(key("b"), "b".into(), Tier::Warm).await;
    assert!(f.store.get(&key("a")).await.is_none());
    assert_eq!(f.metrics.evictions.with_label_values(&["warm"]).get(), 1);
    assert!(f.metrics.store_unavailable.with_label_values(&["put"]).get() >= 1);

    f.cold.set_available(true);
    assert_eq!(f.store.get(&key("b")).await.unwrap().value, "b");
}

#[tokio::test]
async fn test_file_cold_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let cold = Arc::new(FileColdStore::new(dir.path()).await.unwrap());

    let mut config = Config::default();
    config.tiers.shards = 1;
    config.tiers.hot_capacity = 1;
    config.tiers.warm_capacity = 1;
    config.cold.compress_threshold = 16;
    let store: CacheStore<String> =
        CacheStore::new(&config, cold.clone(), Arc::new(CacheMetrics::new().unwrap()));

    let big = "x".repeat(1024);
    store.put(key("doc:1"), big.clone(), Tier::Warm).await;
    store.put(key("doc:2"), "small".into(), Tier::Warm).await;
    assert_eq!(cold.keys().await.unwrap(), vec![key("doc:1")]);

    assert!(store.promote(&key("doc:1")).await);
    assert!(cold.keys().await.unwrap().is_empty());
    assert_eq!(store.get(&key("doc:1")).await.unwrap().value, big);
}

#[tokio::test]
async fn test_file_cold_store_accepts_long_keys() {
    let dir = tempfile::tempdir().unwrap();
    let cold = Arc::new(FileColdStore::new(dir.path()).await.unwrap());
    let mut config = Config::default();
    config.tiers.shards = 1;
    config.tiers.hot_capacity = 1;
    config.tiers.warm_capacity = 1;
    let metrics = Arc::new(CacheMetrics::new().unwrap());
    let store: CacheStore<String> = CacheStore::new(&config, cold.clone(), metrics.clone());

    let long = key(&"k".repeat(200));
    store.put(long.clone(), "v".into(), Tier::Warm).await;
    store.put(key("short"), "s".into(), Tier::Warm).await;

    assert_eq!(store.locate(&long).await, vec![Tier::Cold]);
    assert_eq!(cold.keys().await.unwrap(), vec![long.clone()]);
    assert_eq!(metrics.store_unavailable.with_label_values(&["put"]).get(), 0);
    assert_eq!(store.get(&long).await.unwrap().value, "v");
}

#[tokio::test]
async fn test_bytes_values_round_trip_through_cold() {
    let mut config = Config::default();
    config.tiers.shards = 1;
    config.tiers.hot_capacity = 1;
    config.tiers.warm_capacity = 1;
    let store: CacheStore<Bytes> = CacheStore::new(
        &config,
        Arc::new(InMemoryColdStore::new()),
        Arc::new(CacheMetrics::new().unwrap()),
    );

    store.put(key("a"), Bytes::from_static(b"\x00\xffraw"), Tier::Warm).await;
    store.put(key("b"), Bytes::from_static(b"other"), Tier::Warm).await;

    let found = store.get(&key("a")).await.unwrap();
    assert_eq!(found.tier, Tier::Cold);
    assert_eq!(found.value, Bytes::from_static(b"\x00\xffraw"));
}

#[tokio::test]
async fn test_get_stale_reads_any_tier() {
    let f = fixture(2, 2);
    f.store.put(key("h"), "hot".into(), Tier::Hot).await;
    f.store.put(key("c"), "cold".into(), Tier::Cold).await;

    assert_eq!(f.store.get_stale(&key("h")).await.as_deref(), Some("hot"));
    assert_eq!(f.store.get_stale(&key("c")).await.as_deref(), Some("cold"));
    assert_eq!(f.store.get_stale(&key("none")).await, None);
}

#[tokio::test]
async fn test_invalidate_prefix_across_tiers() {
    let f = fixture(1, 1);
    f.store.put(key("user:1:a"), "1".into(), Tier::Hot).await;
    f.store.put(key("user:1:b"), "2".into(), Tier::Warm).await;
    f.store.put(key("user:1:c"), "3".into(), Tier::Cold).await;
    f.store.put(key("user:2:a"), "4".into(), Tier::Cold).await;

    let removed = f
        .store
        .invalidate(|k| k.as_str().starts_with("user:1:"))
        .await;
    assert_eq!(removed, 3);
    assert!(f.store.locate(&key("user:1:c")).await.is_empty());
    assert_eq!(f.store.locate(&key("user:2:a")).await, vec![Tier::Cold]);
}

/// Cold backend whose writes take a while to land.
struct SlowWrites {
    inner: InMemoryColdStore,
    delay: Duration,
}

#[async_trait]
impl ColdStore for SlowWrites {
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &CacheKey, payload: Bytes) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(key, payload).await
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn keys(&self) -> Result<Vec<CacheKey>> {
        self.inner.keys().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recached_key_outruns_slow_demotion() {
    let mut config = Config::default();
    config.tiers.shards = 1;
    config.tiers.hot_capacity = 1;
    config.tiers.warm_capacity = 1;
    let cold = Arc::new(SlowWrites {
        inner: InMemoryColdStore::new(),
        delay: Duration::from_millis(100),
    });
    let store: Arc<CacheStore<String>> = Arc::new(CacheStore::new(
        &config,
        cold.clone(),
        Arc::new(CacheMetrics::new().unwrap()),
    ));

    store.put(key("a"), "a1".into(), Tier::Warm).await;
    let evict_a = {
        let store = store.clone();
        tokio::spawn(async move { store.put(key("b"), "b".into(), Tier::Warm).await })
    };

    // `a` is on its way to Cold and visible nowhere.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(store.get(&key("a")).await.is_none());

    let recache_a = {
        let store = store.clone();
        tokio::spawn(async move { store.put(key("a"), "a2".into(), Tier::Warm).await })
    };
    evict_a.await.unwrap();
    recache_a.await.unwrap();

    assert_eq!(store.locate(&key("a")).await, vec![Tier::Warm]);
    assert_eq!(store.get(&key("a")).await.unwrap().value, "a2");
    assert!(cold.inner.get(&key("a")).await.unwrap().is_none());
    assert_eq!(store.locate(&key("b")).await, vec![Tier::Cold]);
}

#[tokio::test]
async fn test_invalidate_voids_cold_write_in_flight() {
    let mut config = Config::default();
    config.tiers.shards = 1;
    config.tiers.warm_capacity = 1;
    let cold = Arc::new(SlowWrites {
        inner: InMemoryColdStore::new(),
        delay: Duration::from_millis(50),
    });
    let store: Arc<CacheStore<String>> = Arc::new(CacheStore::new(
        &config,
        cold.clone(),
        Arc::new(CacheMetrics::new().unwrap()),
    ));

    store.put(key("a"), "a".into(), Tier::Warm).await;
    let evict_a = {
        let store = store.clone();
        tokio::spawn(async move { store.put(key("b"), "b".into(), Tier::Warm).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    store.invalidate(|k| k.as_str() == "a").await;
    evict_a.await.unwrap();

    assert!(store.locate(&key("a")).await.is_empty());
    assert!(store.get_stale(&key("a")).await.is_none());
}
