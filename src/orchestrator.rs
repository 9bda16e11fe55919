//! The cache façade used by request handlers.
//!
//! `get` checks the tiers, and on a miss runs the caller's fetch as a
//! background job under admission control. Every job stores its result in
//! the Warm tier exactly once, however many callers coalesced onto it.
//! Accesses feed the [`PredictiveLoader`]; its predictions become
//! speculative jobs through the same admission and coalescing path.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info};

use crate::cache::cold::ColdStore;
use crate::cache::entry::{CacheKey, CacheValue, Tier};
use crate::cache::prefetcher::PredictiveLoader;
use crate::cache::store::{CacheStore, TierStats};
use crate::config::Config;
use crate::error::{FetchCause, Result};
use crate::jobs::job::{FetchFn, JobHandle, JobId, JobSnapshot, Priority};
use crate::jobs::pool::WorkerPool;
use crate::jobs::queue::{JobQueue, QueueStats};
use crate::metrics::CacheMetrics;
use crate::rate_limiter::RateLimiter;

/// Supplies fetch functions for keys nobody has asked for yet.
///
/// Speculative preloading needs one: a predicted key carries no fetch of
/// its own.
pub trait PreloadResolver<V>: Send + Sync {
    fn resolve(&self, key: &CacheKey) -> Option<FetchFn<V>>;
}

impl<V, F> PreloadResolver<V> for F
where
    F: Fn(&CacheKey) -> Option<FetchFn<V>> + Send + Sync,
{
    fn resolve(&self, key: &CacheKey) -> Option<FetchFn<V>> {
        self(key)
    }
}

/// Combined view for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub tiers: Vec<TierStats>,
    pub queue: QueueStats,
    pub workers: usize,
    pub identities_tracked: usize,
}

pub struct CacheOrchestrator<V> {
    store: Arc<CacheStore<V>>,
    queue: Arc<JobQueue<V>>,
    pool: WorkerPool<V>,
    loader: PredictiveLoader,
    resolver: Option<Arc<dyn PreloadResolver<V>>>,
    metrics: Arc<CacheMetrics>,
    await_timeout: Duration,
}

impl<V: CacheValue> CacheOrchestrator<V> {
    /// Build every component and start the worker pool on the current runtime.
    pub fn start(config: &Config, cold: Arc<dyn ColdStore>, metrics: Arc<CacheMetrics>) -> Self {
        let store = Arc::new(CacheStore::new(config, cold, metrics.clone()));
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let queue = Arc::new(JobQueue::new(&config.queue, limiter.clone(), metrics.clone()));
        let pool = WorkerPool::start(
            queue.clone(),
            config.queue.workers,
            config.queue.reap_interval(),
            limiter,
        );

        info!(
            hot = config.tiers.hot_capacity,
            warm = config.tiers.warm_capacity,
            workers = config.queue.workers,
            rate_limit = config.rate_limit.max_requests,
            prefetch = config.prefetch.enabled,
            "Cache orchestrator started"
        );

        Self {
            store,
            queue,
            pool,
            loader: PredictiveLoader::new(config.prefetch.clone()),
            resolver: None,
            metrics,
            await_timeout: config.queue.await_timeout(),
        }
    }

    /// Enable speculative preloading through `resolver`.
    pub fn with_preload_resolver(mut self, resolver: Arc<dyn PreloadResolver<V>>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Return the cached value for `key`, or run `fetch` to produce it.
    ///
    /// Errors are never retried here: `AdmissionDenied` and `QueueFull`
    /// come back before any work starts, `AwaitTimeout` leaves the job
    /// running for later callers, and `FetchFailed` carries the cause.
    pub async fn get(&self, identity: &str, key: &CacheKey, fetch: FetchFn<V>) -> Result<V> {
        self.get_with_timeout(identity, key, fetch, self.await_timeout)
            .await
    }

    /// [`get`](Self::get) with a caller-chosen wait budget.
    pub async fn get_with_timeout(
        &self,
        identity: &str,
        key: &CacheKey,
        fetch: FetchFn<V>,
        timeout: Duration,
    ) -> Result<V> {
        if let Some(found) = self.store.get_and_promote(key).await {
            debug!(key = %key, tier = %found.tier, identity, "Cache hit");
            self.after_access(identity, key);
            return Ok(found.value);
        }

        let handle = self.submit(identity, key, fetch, Priority::Normal)?;
        let value = handle.await_result(timeout).await?;
        self.after_access(identity, key);
        Ok(value)
    }

    /// [`get`](Self::get), falling back to an expired or cold copy when the
    /// fetch cannot be completed.
    pub async fn get_or_stale(
        &self,
        identity: &str,
        key: &CacheKey,
        fetch: FetchFn<V>,
    ) -> Result<V> {
        match self.get(identity, key, fetch).await {
            Ok(value) => Ok(value),
            Err(err) => match self.store.get_stale(key).await {
                Some(stale) => {
                    debug!(key = %key, error = %err, "Served stale value");
                    Ok(stale)
                }
                None => Err(err),
            },
        }
    }

    /// Submit `fetch` for `key` with the result stored into Warm on success.
    pub fn submit(
        &self,
        identity: &str,
        key: &CacheKey,
        fetch: FetchFn<V>,
        priority: Priority,
    ) -> Result<JobHandle<V>> {
        let wrapped = store_into_warm(self.store.clone(), key.clone(), fetch);
        self.queue.submit(identity, key.clone(), wrapped, priority)
    }

    /// Remove every entry whose key matches `predicate`.
    pub async fn invalidate<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CacheKey) -> bool + Send + Sync,
    {
        let removed = self.store.invalidate(predicate).await;
        info!(removed, "Cache invalidated");
        removed
    }

    pub async fn get_stale(&self, key: &CacheKey) -> Option<V> {
        self.store.get_stale(key).await
    }

    pub fn job_status(&self, id: JobId) -> Option<JobSnapshot> {
        self.queue.status(id)
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            tiers: self.store.stats(),
            queue: self.queue.stats(),
            workers: self.pool.workers(),
            identities_tracked: self.loader.identities(),
        }
    }

    pub fn store(&self) -> &CacheStore<V> {
        &self.store
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Stop accepting work and wait for running jobs to finish.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    fn after_access(&self, identity: &str, key: &CacheKey) {
        if !self.loader.config().enabled {
            return;
        }
        self.loader.record_access(identity, key);
        self.schedule_preloads(identity, key);
    }

    /// Queue speculative jobs for predicted keys not already in memory.
    /// Submission never waits; every outcome is dropped.
    fn schedule_preloads(&self, identity: &str, current: &CacheKey) {
        let Some(resolver) = &self.resolver else {
            return;
        };

        for key in self.loader.predict(identity, current) {
            if self.store.memory_tier_of(&key).is_some() {
                continue;
            }
            let Some(fetch) = resolver.resolve(&key) else {
                continue;
            };
            match self.submit(identity, &key, fetch, Priority::Speculative) {
                Ok(handle) if !handle.is_coalesced() => {
                    self.metrics.speculative_scheduled.inc();
                    debug!(
                        key = %key,
                        identity,
                        job_id = handle.id(),
                        "Scheduled speculative preload"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(key = %key, identity, error = %e, "Speculative preload skipped");
                }
            }
        }
    }
}

/// Wrap `fetch` so a successful result lands in the Warm tier before any
/// waiter observes it.
fn store_into_warm<V: CacheValue>(
    store: Arc<CacheStore<V>>,
    key: CacheKey,
    fetch: FetchFn<V>,
) -> FetchFn<V> {
    Box::new(move || {
        async move {
            let value = fetch().await?;
            store.put(key, value.clone(), Tier::Warm).await;
            Ok::<V, FetchCause>(value)
        }
        .boxed()
    })
}
