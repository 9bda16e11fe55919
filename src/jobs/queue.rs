//! Job queue: admission, coalescing and priority scheduling.
//!
//! Submissions pass the rate limiter first, then join any in-flight job for
//! the same key, and only then create a new job. Pending jobs wait in one
//! FIFO per priority level; a job that has waited past the starvation bound
//! is served before higher levels.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::cache::entry::{CacheKey, CacheValue};
use crate::config::QueueConfig;
use crate::error::{CacheError, FetchCause, Result};
use crate::jobs::job::{
    FetchFn, Job, JobHandle, JobId, JobOutcome, JobSnapshot, PoolStopped, Priority,
};
use crate::metrics::CacheMetrics;
use crate::rate_limiter::RateLimiter;

/// Pending jobs, one FIFO per priority level.
struct PendingQueue<V> {
    levels: [VecDeque<Arc<Job<V>>>; Priority::LEVELS],
}

impl<V: CacheValue> PendingQueue<V> {
    fn new() -> Self {
        Self {
            levels: std::array::from_fn(|_| VecDeque::new()),
        }
    }

    fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    fn push(&mut self, job: Arc<Job<V>>) {
        self.levels[job.priority().index()].push_back(job);
    }

    /// Move a still-pending job to a higher level, keeping FIFO within it.
    fn raise(&mut self, job: &Arc<Job<V>>, priority: Priority) -> bool {
        let current = job.priority();
        if priority <= current {
            return false;
        }
        let level = &mut self.levels[current.index()];
        match level.iter().position(|j| j.id == job.id) {
            Some(pos) => {
                level.remove(pos);
                job.set_priority(priority);
                self.levels[priority.index()].push_back(job.clone());
                true
            }
            None => false,
        }
    }

    /// Next job to run: the oldest starving head if any, else the head of
    /// the highest non-empty level.
    fn pop(&mut self, now: Instant, starvation: Duration) -> Option<Arc<Job<V>>> {
        let starving = self
            .levels
            .iter()
            .enumerate()
            .filter_map(|(lvl, q)| q.front().map(|j| (lvl, j.created_at)))
            .filter(|(_, created)| now.saturating_duration_since(*created) >= starvation)
            .min_by_key(|(_, created)| *created)
            .map(|(lvl, _)| lvl);

        let level = starving.or_else(|| {
            (0..Priority::LEVELS)
                .rev()
                .find(|l| !self.levels[*l].is_empty())
        })?;
        self.levels[level].pop_front()
    }

    fn drain(&mut self) -> Vec<Arc<Job<V>>> {
        self.levels.iter_mut().flat_map(|q| q.drain(..)).collect()
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub retained: usize,
    pub capacity: usize,
}

/// The bounded, coalescing job queue.
pub struct JobQueue<V> {
    pending: Mutex<PendingQueue<V>>,

    /// Every job still within its retention window, by ID.
    jobs: DashMap<JobId, Arc<Job<V>>>,

    /// Pending or running job per key.
    in_flight: DashMap<CacheKey, Arc<Job<V>>>,

    limiter: Arc<RateLimiter>,
    capacity: usize,
    starvation: Duration,
    retention: Duration,
    notify: Notify,
    closed: AtomicBool,
    metrics: Arc<CacheMetrics>,
}

impl<V: CacheValue> JobQueue<V> {
    pub fn new(
        config: &QueueConfig,
        limiter: Arc<RateLimiter>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            pending: Mutex::new(PendingQueue::new()),
            jobs: DashMap::new(),
            in_flight: DashMap::new(),
            limiter,
            capacity: config.capacity,
            starvation: config.starvation(),
            retention: config.retention(),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    /// Submit a fetch for `key` on behalf of `identity`.
    ///
    /// Fails with `AdmissionDenied` when the identity is over its limit and
    /// with `QueueFull` when no pending slot is free. If a job for `key` is
    /// already pending or running, the returned handle joins it and `fetch`
    /// is dropped unused.
    pub fn submit(
        &self,
        identity: &str,
        key: CacheKey,
        fetch: FetchFn<V>,
        priority: Priority,
    ) -> Result<JobHandle<V>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::ShuttingDown);
        }

        if !self.limiter.allow(identity) {
            self.metrics.admission_denied.inc();
            return Err(CacheError::AdmissionDenied {
                identity: identity.to_owned(),
            });
        }

        // The entry guard serializes submissions for this key until the new
        // job is both queued and indexed.
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(existing) => {
                let job = existing.get().clone();
                if priority > job.priority() && self.pending.lock().raise(&job, priority) {
                    debug!(job_id = job.id, priority = priority.as_str(), "Raised job priority");
                }
                self.metrics.jobs_coalesced.inc();
                debug!(job_id = job.id, key = %key, identity, "Coalesced onto in-flight job");
                Ok(JobHandle::new(job, true))
            }
            Entry::Vacant(slot) => {
                let job = Job::new(identity, key, fetch, priority);
                {
                    let mut pending = self.pending.lock();
                    // `close` drains under this lock; a push after the drain would never run.
                    if self.closed.load(Ordering::SeqCst) {
                        return Err(CacheError::ShuttingDown);
                    }
                    if pending.len() >= self.capacity {
                        self.metrics.queue_full.inc();
                        return Err(CacheError::QueueFull {
                            capacity: self.capacity,
                        });
                    }
                    pending.push(job.clone());
                    self.metrics.queue_depth.set(pending.len() as i64);
                }

                slot.insert(job.clone());
                self.jobs.insert(job.id, job.clone());
                self.metrics
                    .jobs_submitted
                    .with_label_values(&[priority.as_str()])
                    .inc();
                self.metrics.jobs_in_flight.inc();
                debug!(
                    job_id = job.id,
                    key = %job.key,
                    identity,
                    priority = priority.as_str(),
                    "Scheduled job"
                );

                self.notify.notify_one();
                Ok(JobHandle::new(job, false))
            }
        }
    }

    /// Dequeue the next job to run, if any.
    pub fn try_pop(&self) -> Option<Arc<Job<V>>> {
        let mut pending = self.pending.lock();
        let job = pending.pop(Instant::now(), self.starvation);
        self.metrics.queue_depth.set(pending.len() as i64);
        job
    }

    /// Resolves when a job may have been queued.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Record a job's outcome and release its key for new submissions.
    pub fn complete(&self, job: &Arc<Job<V>>, outcome: JobOutcome<V>) {
        let label = if outcome.is_ok() { "completed" } else { "failed" };
        if job.finish(outcome) {
            self.metrics.jobs_finished.with_label_values(&[label]).inc();
        }
        if self
            .in_flight
            .remove_if(&job.key, |_, current| current.id == job.id)
            .is_some()
        {
            self.metrics.jobs_in_flight.dec();
        }
    }

    /// Status of a job still within its retention window.
    pub fn status(&self, id: JobId) -> Option<JobSnapshot> {
        self.jobs.get(&id).map(|job| job.snapshot())
    }

    /// Handle to a job still within its retention window.
    pub fn handle(&self, id: JobId) -> Option<JobHandle<V>> {
        self.jobs.get(&id).map(|job| JobHandle::new(job.clone(), true))
    }

    /// Drop finished jobs older than the retention window.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.jobs.len();
        let retention = self.retention;
        self.jobs.retain(|_, job| match job.completed_at() {
            Some(done) => now.saturating_duration_since(done) < retention,
            None => true,
        });
        let purged = before.saturating_sub(self.jobs.len());
        if purged > 0 {
            debug!(purged, "Purged finished jobs");
        }
        purged
    }

    /// Refuse new submissions and fail every job still waiting in the queue.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let drained = self.pending.lock().drain();
        for job in &drained {
            let cause: FetchCause = Arc::new(PoolStopped);
            self.complete(job, Err(cause));
        }
        self.metrics.queue_depth.set(0);
        self.notify.notify_waiters();
        if !drained.is_empty() {
            info!(failed = drained.len(), "Job queue closed with pending jobs");
        }
        drained.len()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.pending.lock().len(),
            in_flight: self.in_flight.len(),
            retained: self.jobs.len(),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::jobs::job::{fetch_fn, JobState};

    fn queue(capacity: usize, max_requests: u32) -> JobQueue<String> {
        let config = QueueConfig {
            capacity,
            starvation_ms: 60_000,
            ..Default::default()
        };
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig {
            max_requests,
            window_ms: 60_000,
        }));
        JobQueue::new(&config, limiter, Arc::new(CacheMetrics::new().unwrap()))
    }

    fn ok(v: &'static str) -> FetchFn<String> {
        fetch_fn(move || async move { Ok::<_, std::io::Error>(v.to_string()) })
    }

    #[test]
    fn test_priority_ordering() {
        let q = queue(8, 0);
        q.submit("u", CacheKey::new("low"), ok("1"), Priority::Speculative).unwrap();
        q.submit("u", CacheKey::new("normal"), ok("2"), Priority::Normal).unwrap();
        q.submit("u", CacheKey::new("high"), ok("3"), Priority::High).unwrap();
        q.submit("u", CacheKey::new("normal2"), ok("4"), Priority::Normal).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| q.try_pop())
            .map(|j| j.key.to_string())
            .collect();
        assert_eq!(order, vec!["high", "normal", "normal2", "low"]);
    }

    #[test]
    fn test_coalescing_returns_same_job() {
        let q = queue(8, 0);
        let a = q.submit("u1", CacheKey::new("k"), ok("1"), Priority::Normal).unwrap();
        let b = q.submit("u2", CacheKey::new("k"), ok("2"), Priority::Normal).unwrap();

        assert_eq!(a.id(), b.id());
        assert!(!a.is_coalesced());
        assert!(b.is_coalesced());
        assert_eq!(q.stats().pending, 1);
    }

    #[test]
    fn test_coalesced_submit_raises_priority() {
        let q = queue(8, 0);
        q.submit("u", CacheKey::new("other"), ok("1"), Priority::Normal).unwrap();
        q.submit("u", CacheKey::new("k"), ok("2"), Priority::Speculative).unwrap();
        q.submit("u", CacheKey::new("k"), ok("3"), Priority::High).unwrap();

        assert_eq!(q.try_pop().unwrap().key, CacheKey::new("k"));
    }

    #[test]
    fn test_admission_checked_before_coalescing() {
        let q = queue(8, 3);
        for _ in 0..3 {
            q.submit("u1", CacheKey::new("k"), ok("v"), Priority::Normal).unwrap();
        }
        let err = q.submit("u1", CacheKey::new("k"), ok("v"), Priority::Normal);
        assert!(matches!(err, Err(CacheError::AdmissionDenied { .. })));
    }

    #[test]
    fn test_queue_full() {
        let q = queue(2, 0);
        q.submit("u", CacheKey::new("a"), ok("1"), Priority::Normal).unwrap();
        q.submit("u", CacheKey::new("b"), ok("2"), Priority::Normal).unwrap();
        let err = q.submit("u", CacheKey::new("c"), ok("3"), Priority::Normal);
        assert!(matches!(err, Err(CacheError::QueueFull { capacity: 2 })));

        // A rejected submission leaves no trace for its key.
        q.try_pop();
        assert!(q.submit("u", CacheKey::new("c"), ok("3"), Priority::Normal).is_ok());
    }

    #[test]
    fn test_starving_job_jumps_ahead() {
        let mut pending = PendingQueue::<String>::new();
        let old = Job::new("u", CacheKey::new("old"), ok("1"), Priority::Speculative);
        let fresh = Job::new("u", CacheKey::new("fresh"), ok("2"), Priority::High);
        pending.push(old);
        pending.push(fresh);

        let now = Instant::now() + Duration::from_secs(5);
        let first = pending.pop(now, Duration::from_secs(10)).unwrap();
        assert_eq!(first.key, CacheKey::new("fresh"));

        let old = Job::new("u", CacheKey::new("old2"), ok("1"), Priority::Speculative);
        let fresh = Job::new("u", CacheKey::new("fresh2"), ok("2"), Priority::High);
        pending.push(fresh);
        pending.push(old);
        // Everything queued before `now - 1s` counts as starving; oldest first.
        let first = pending.pop(now, Duration::from_secs(1)).unwrap();
        assert_eq!(first.key, CacheKey::new("old"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_during_submits_strands_nothing() {
        let q = Arc::new(queue(1024, 0));
        let submitters: Vec<_> = (0..4)
            .map(|t| {
                let q = q.clone();
                tokio::spawn(async move {
                    (0..200)
                        .filter_map(|i| {
                            let key = CacheKey::new(format!("{t}:{i}"));
                            q.submit("u", key, ok("v"), Priority::Normal).ok()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        tokio::task::yield_now().await;
        q.close();
        let mut accepted = Vec::new();
        for submitter in submitters {
            accepted.extend(submitter.await.unwrap());
        }

        // No worker ever ran, so every accepted job was failed by close.
        for handle in &accepted {
            assert_eq!(handle.state(), JobState::Failed);
        }
        assert_eq!(q.stats().pending, 0);
        assert_eq!(q.stats().in_flight, 0);
        assert!(matches!(
            q.submit("u", CacheKey::new("late"), ok("v"), Priority::Normal),
            Err(CacheError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_complete_releases_key() {
        let q = queue(8, 0);
        let handle = q.submit("u", CacheKey::new("k"), ok("v"), Priority::Normal).unwrap();
        let job = q.try_pop().unwrap();
        let fetch = job.claim().unwrap();
        q.complete(&job, fetch().await);

        assert_eq!(handle.state(), JobState::Completed);
        assert_eq!(q.stats().in_flight, 0);
        let again = q.submit("u", CacheKey::new("k"), ok("v2"), Priority::Normal).unwrap();
        assert_ne!(again.id(), handle.id());
    }

    #[tokio::test]
    async fn test_retention_purge() {
        let q = queue(8, 0);
        let handle = q.submit("u", CacheKey::new("k"), ok("v"), Priority::Normal).unwrap();
        let job = q.try_pop().unwrap();
        let fetch = job.claim().unwrap();
        q.complete(&job, fetch().await);

        assert!(q.status(handle.id()).is_some());
        assert_eq!(q.purge_expired_at(Instant::now()), 0);
        let later = Instant::now() + Duration::from_secs(301);
        assert_eq!(q.purge_expired_at(later), 1);
        assert!(q.status(handle.id()).is_none());
    }

    #[tokio::test]
    async fn test_close_fails_pending() {
        let q = queue(8, 0);
        let handle = q.submit("u", CacheKey::new("k"), ok("v"), Priority::Normal).unwrap();
        assert_eq!(q.close(), 1);

        let err = handle.await_result(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, CacheError::FetchFailed { .. }));
        assert!(matches!(
            q.submit("u", CacheKey::new("k"), ok("v"), Priority::Normal),
            Err(CacheError::ShuttingDown)
        ));
    }
}
