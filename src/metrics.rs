//! Prometheus metrics shared by every cache component.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// All counters and gauges, registered in a private registry.
#[derive(Clone)]
pub struct CacheMetrics {
    registry: Registry,

    /// Hits by tier.
    pub hits: IntCounterVec,
    pub misses: IntCounter,
    /// Promotions into Hot, by source tier.
    pub promotions: IntCounterVec,
    /// Demotions by destination tier.
    pub demotions: IntCounterVec,
    /// Entries dropped from the cache by eviction, by tier.
    pub evictions: IntCounterVec,
    pub expirations: IntCounter,
    /// Absorbed cold-store failures, by operation.
    pub store_unavailable: IntCounterVec,

    /// Jobs created, by priority.
    pub jobs_submitted: IntCounterVec,
    pub jobs_coalesced: IntCounter,
    /// Jobs that reached a terminal state, by outcome.
    pub jobs_finished: IntCounterVec,
    pub admission_denied: IntCounter,
    pub queue_full: IntCounter,
    pub speculative_scheduled: IntCounter,
    pub queue_depth: IntGauge,
    pub jobs_in_flight: IntGauge,
}

impl CacheMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("predictive_cache".to_string()), None)?;

        let hits = IntCounterVec::new(Opts::new("hits_total", "Cache hits by tier"), &["tier"])?;
        let misses = IntCounter::new("misses_total", "Lookups that missed every tier")?;
        let promotions = IntCounterVec::new(
            Opts::new("promotions_total", "Entries promoted into the hot tier"),
            &["from"],
        )?;
        let demotions = IntCounterVec::new(
            Opts::new("demotions_total", "Entries demoted one tier down"),
            &["to"],
        )?;
        let evictions = IntCounterVec::new(
            Opts::new("evictions_total", "Entries dropped by eviction"),
            &["tier"],
        )?;
        let expirations = IntCounter::new("expirations_total", "Entries dropped by TTL")?;
        let store_unavailable = IntCounterVec::new(
            Opts::new("store_unavailable_total", "Absorbed cold store failures"),
            &["op"],
        )?;
        let jobs_submitted = IntCounterVec::new(
            Opts::new("jobs_submitted_total", "Jobs created"),
            &["priority"],
        )?;
        let jobs_coalesced = IntCounter::new(
            "jobs_coalesced_total",
            "Submissions merged onto an in-flight job",
        )?;
        let jobs_finished = IntCounterVec::new(
            Opts::new("jobs_finished_total", "Jobs that reached a terminal state"),
            &["outcome"],
        )?;
        let admission_denied =
            IntCounter::new("admission_denied_total", "Submissions rejected by rate limiting")?;
        let queue_full =
            IntCounter::new("queue_full_total", "Submissions rejected by backpressure")?;
        let speculative_scheduled = IntCounter::new(
            "speculative_scheduled_total",
            "Speculative preload jobs accepted",
        )?;
        let queue_depth = IntGauge::new("queue_depth", "Pending jobs")?;
        let jobs_in_flight = IntGauge::new("jobs_in_flight", "Pending or running jobs")?;

        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(misses.clone()))?;
        registry.register(Box::new(promotions.clone()))?;
        registry.register(Box::new(demotions.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(expirations.clone()))?;
        registry.register(Box::new(store_unavailable.clone()))?;
        registry.register(Box::new(jobs_submitted.clone()))?;
        registry.register(Box::new(jobs_coalesced.clone()))?;
        registry.register(Box::new(jobs_finished.clone()))?;
        registry.register(Box::new(admission_denied.clone()))?;
        registry.register(Box::new(queue_full.clone()))?;
        registry.register(Box::new(speculative_scheduled.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(jobs_in_flight.clone()))?;

        Ok(Self {
            registry,
            hits,
            misses,
            promotions,
            demotions,
            evictions,
            expirations,
            store_unavailable,
            jobs_submitted,
            jobs_coalesced,
            jobs_finished,
            admission_denied,
            queue_full,
            speculative_scheduled,
            queue_depth,
            jobs_in_flight,
        })
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
