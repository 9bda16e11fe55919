//! Job types: one asynchronous fetch of one cache key.
//!
//! State machine: `Pending → Running → {Completed | Failed}`. Terminal
//! states never change; a retry is a new job. The result is published once
//! through a watch channel so any number of handles can await it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::cache::entry::{CacheKey, CacheValue};
use crate::error::{CacheError, FetchCause, Result};

/// Unique identifier for a job.
pub type JobId = u64;

/// Global monotonic job ID counter.
static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a new unique job ID.
pub fn new_job_id() -> JobId {
    NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed)
}

/// Scheduling priority. Higher is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Predictive preload nobody is waiting for yet.
    Speculative,
    /// A caller is blocked on the result.
    Normal,
    High,
}

impl Priority {
    pub const LEVELS: usize = 3;

    pub fn index(&self) -> usize {
        match self {
            Priority::Speculative => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Speculative => "speculative",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Result published by a finished job.
pub type JobOutcome<V> = std::result::Result<V, FetchCause>;

/// Future produced by a fetch function.
pub type FetchFuture<V> = BoxFuture<'static, JobOutcome<V>>;

/// Caller-supplied fetch, run at most once by one worker.
pub type FetchFn<V> = Box<dyn FnOnce() -> FetchFuture<V> + Send>;

/// Box an async closure as a [`FetchFn`].
pub fn fetch_fn<V, F, Fut, E>(f: F) -> FetchFn<V>
where
    V: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    Box::new(move || {
        async move {
            f().await.map_err(|e| {
                let boxed: Box<dyn std::error::Error + Send + Sync> = e.into();
                FetchCause::from(boxed)
            })
        }
        .boxed()
    })
}

/// A fetch function panicked instead of returning.
#[derive(Error, Debug)]
#[error("fetch panicked: {0}")]
pub struct FetchPanicked(pub String);

/// The job was still queued when the worker pool stopped.
#[derive(Error, Debug)]
#[error("worker pool stopped before the job ran")]
pub struct PoolStopped;

#[derive(Debug)]
struct JobMeta {
    state: JobState,
    priority: Priority,
    started_at: Option<Instant>,
    completed_at: Option<Instant>,
    error: Option<String>,
}

/// A single fetch job.
pub struct Job<V> {
    pub id: JobId,

    /// Identity whose request created the job.
    pub identity: String,

    pub key: CacheKey,

    pub created_at: Instant,

    meta: Mutex<JobMeta>,

    /// Taken by the worker that claims the job.
    fetch: Mutex<Option<FetchFn<V>>>,

    done: watch::Sender<Option<JobOutcome<V>>>,
}

/// Serializable view of a job, for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub identity: String,
    pub key: String,
    pub priority: Priority,
    pub state: JobState,
    pub age_ms: u64,
    /// Time spent queued, once claimed.
    pub queued_ms: Option<u64>,
    /// Time spent running, once finished.
    pub run_ms: Option<u64>,
    pub error: Option<String>,
}

impl<V: CacheValue> Job<V> {
    pub fn new(identity: &str, key: CacheKey, fetch: FetchFn<V>, priority: Priority) -> Arc<Self> {
        let (done, _) = watch::channel(None);
        Arc::new(Self {
            id: new_job_id(),
            identity: identity.to_owned(),
            key,
            created_at: Instant::now(),
            meta: Mutex::new(JobMeta {
                state: JobState::Pending,
                priority,
                started_at: None,
                completed_at: None,
                error: None,
            }),
            fetch: Mutex::new(Some(fetch)),
            done,
        })
    }

    pub fn state(&self) -> JobState {
        self.meta.lock().state
    }

    pub fn priority(&self) -> Priority {
        self.meta.lock().priority
    }

    pub(crate) fn set_priority(&self, priority: Priority) {
        self.meta.lock().priority = priority;
    }

    pub fn completed_at(&self) -> Option<Instant> {
        self.meta.lock().completed_at
    }

    /// `Pending → Running`. Returns the fetch function to the single caller
    /// that wins the claim.
    pub(crate) fn claim(&self) -> Option<FetchFn<V>> {
        let mut meta = self.meta.lock();
        if meta.state != JobState::Pending {
            return None;
        }
        meta.state = JobState::Running;
        meta.started_at = Some(Instant::now());
        self.fetch.lock().take()
    }

    /// Move to a terminal state and wake every waiter. Later calls are ignored.
    pub(crate) fn finish(&self, outcome: JobOutcome<V>) -> bool {
        {
            let mut meta = self.meta.lock();
            if meta.state.is_terminal() {
                return false;
            }
            meta.state = if outcome.is_ok() {
                JobState::Completed
            } else {
                JobState::Failed
            };
            meta.completed_at = Some(Instant::now());
            meta.error = outcome.as_ref().err().map(|e| e.to_string());
        }
        self.fetch.lock().take();
        self.done.send_replace(Some(outcome));
        true
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let meta = self.meta.lock();
        let ms = |d: Duration| d.as_millis() as u64;
        JobSnapshot {
            id: self.id,
            identity: self.identity.clone(),
            key: self.key.to_string(),
            priority: meta.priority,
            state: meta.state,
            age_ms: ms(self.created_at.elapsed()),
            queued_ms: meta
                .started_at
                .map(|s| ms(s.saturating_duration_since(self.created_at))),
            run_ms: meta
                .started_at
                .zip(meta.completed_at)
                .map(|(s, c)| ms(c.saturating_duration_since(s))),
            error: meta.error.clone(),
        }
    }
}

/// A caller's reference to a (possibly shared) job.
#[derive(Clone)]
pub struct JobHandle<V> {
    job: Arc<Job<V>>,
    coalesced: bool,
}

impl<V: CacheValue> JobHandle<V> {
    pub(crate) fn new(job: Arc<Job<V>>, coalesced: bool) -> Self {
        Self { job, coalesced }
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn key(&self) -> &CacheKey {
        &self.job.key
    }

    pub fn state(&self) -> JobState {
        self.job.state()
    }

    /// Whether this handle joined a job created by an earlier submission.
    pub fn is_coalesced(&self) -> bool {
        self.coalesced
    }

    /// Wait until the job is terminal or `timeout` elapses.
    ///
    /// A timeout only abandons this wait; the job keeps running for the
    /// other waiters.
    pub async fn await_result(&self, timeout: Duration) -> Result<V> {
        let mut rx = self.job.done.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await;

        match waited {
            Ok(Ok(outcome)) => match &*outcome {
                Some(Ok(value)) => Ok(value.clone()),
                Some(Err(cause)) => Err(CacheError::FetchFailed {
                    key: self.job.key.clone(),
                    source: cause.clone(),
                }),
                None => Err(CacheError::ShuttingDown),
            },
            Ok(Err(_)) => Err(CacheError::ShuttingDown),
            Err(_) => Err(CacheError::AwaitTimeout {
                job_id: self.job.id,
                waited: timeout,
            }),
        }
    }
}
