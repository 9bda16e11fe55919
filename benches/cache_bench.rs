//! Benchmarks for the cache subsystem.

use std::sync::Arc;
use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use predictive_cache::cache::cold::InMemoryColdStore;
use predictive_cache::cache::compressor::{ColdRecord, Compressor};
use predictive_cache::cache::entry::{CacheEntry, CacheKey, Tier};
use predictive_cache::cache::evictor::EvictionBudget;
use predictive_cache::cache::prefetcher::PredictiveLoader;
use predictive_cache::cache::store::CacheStore;
use predictive_cache::cache::tier::LruTier;
use predictive_cache::config::{ColdConfig, Config, PrefetchConfig, RateLimitConfig};
use predictive_cache::metrics::CacheMetrics;
use predictive_cache::rate_limiter::RateLimiter;

fn bench_lru_tier(c: &mut Criterion) {
    let keys: Vec<CacheKey> = (0..10_000).map(|i| CacheKey::new(format!("k{i}"))).collect();

    c.bench_function("lru_insert_10k_cap_1k", |b| {
        b.iter(|| {
            let mut tier = LruTier::new(Tier::Warm, EvictionBudget::new(1_000, None));
            for key in &keys {
                let entry = CacheEntry::new(key.clone(), 0u8.to_string(), Tier::Warm);
                black_box(tier.insert(entry));
            }
        })
    });

    let mut tier = LruTier::new(Tier::Hot, EvictionBudget::new(10_000, None));
    for key in &keys {
        tier.insert(CacheEntry::new(key.clone(), "v".to_string(), Tier::Hot));
    }
    c.bench_function("lru_touch_10k", |b| {
        b.iter(|| {
            for key in &keys {
                black_box(tier.touch(key).is_some());
            }
        })
    });
}

fn bench_store(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let store: CacheStore<String> = CacheStore::new(
        &Config::default(),
        Arc::new(InMemoryColdStore::new()),
        Arc::new(CacheMetrics::new().unwrap()),
    );
    let keys: Vec<CacheKey> = (0..1_000).map(|i| CacheKey::new(format!("q:{i}"))).collect();

    c.bench_function("store_put_get_1k_warm", |b| {
        b.iter(|| {
            runtime.block_on(async {
                for key in &keys {
                    store.put(key.clone(), "value".to_string(), Tier::Warm).await;
                }
                for key in &keys {
                    black_box(store.get(key).await);
                }
            })
        })
    });
}

fn bench_cold_codec(c: &mut Criterion) {
    let compressor = Compressor::new(&ColdConfig::default());
    let record = ColdRecord {
        inserted_at_ms: 0,
        value: "lorem ipsum ".repeat(2_000),
    };

    c.bench_function("cold_encode_24kb", |b| {
        b.iter(|| black_box(compressor.encode(black_box(&record)).unwrap()))
    });

    let payload = compressor.encode(&record).unwrap();
    c.bench_function("cold_decode_24kb", |b| {
        b.iter(|| {
            let decoded: ColdRecord<String> = compressor.decode(black_box(&payload)).unwrap();
            black_box(decoded);
        })
    });
}

fn bench_rate_limiter(c: &mut Criterion) {
    let limiter = RateLimiter::new(&RateLimitConfig {
        max_requests: u32::MAX,
        window_ms: 60_000,
    });
    let identities: Vec<String> = (0..100).map(|i| format!("user-{i}")).collect();
    let now = Instant::now();

    c.bench_function("rate_limiter_allow_100_identities", |b| {
        b.iter(|| {
            for identity in &identities {
                black_box(limiter.allow_at(identity, now));
            }
        })
    });
}

fn bench_prediction(c: &mut Criterion) {
    let loader = PredictiveLoader::new(PrefetchConfig {
        history_len: 256,
        ..Default::default()
    });
    let keys: Vec<CacheKey> = (0..64).map(|i| CacheKey::new(format!("q:{i}"))).collect();
    for i in 0..2_000usize {
        loader.record_access_at("u1", &keys[(i * 7 + i / 5) % keys.len()], i % 24);
    }

    c.bench_function("predict_64_candidates", |b| {
        b.iter(|| black_box(loader.predict_at("u1", black_box(&keys[3]), 9)))
    });
}

criterion_group!(
    benches,
    bench_lru_tier,
    bench_store,
    bench_cold_codec,
    bench_rate_limiter,
    bench_prediction,
);
criterion_main!(benches);
