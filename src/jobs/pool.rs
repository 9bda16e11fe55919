//! Fixed-size worker pool draining the shared [`JobQueue`].
//!
//! Each worker claims one job at a time and runs its fetch to completion. A
//! separate reaper task purges finished jobs past their retention window and
//! idle rate-limit windows.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::entry::CacheValue;
use crate::error::FetchCause;
use crate::jobs::job::{FetchPanicked, Job};
use crate::jobs::queue::JobQueue;
use crate::rate_limiter::RateLimiter;

pub struct WorkerPool<V> {
    queue: Arc<JobQueue<V>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
}

impl<V: CacheValue> WorkerPool<V> {
    /// Spawn `workers` workers plus the reaper on the current runtime.
    pub fn start(
        queue: Arc<JobQueue<V>>,
        workers: usize,
        reap_interval: Duration,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks: Vec<JoinHandle<()>> = (0..workers)
            .map(|worker_id| {
                tokio::spawn(worker_loop(worker_id, queue.clone(), shutdown_rx.clone()))
            })
            .collect();
        tasks.push(tokio::spawn(reaper_loop(
            queue.clone(),
            limiter,
            reap_interval,
            shutdown_rx,
        )));

        info!(workers, "Worker pool started");

        Self {
            queue,
            shutdown_tx,
            tasks: Mutex::new(tasks),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Refuse new jobs, fail queued ones, and wait for running jobs to end.
    pub async fn shutdown(&self) {
        let failed = self.queue.close();
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        info!(failed_pending = failed, "Worker pool stopped");
    }
}

async fn worker_loop<V: CacheValue>(
    worker_id: usize,
    queue: Arc<JobQueue<V>>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker_id, "Worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        if let Some(job) = queue.try_pop() {
            run_job(worker_id, &queue, job).await;
            continue;
        }

        tokio::select! {
            _ = queue.notified() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!(worker_id, "Worker stopped");
}

async fn run_job<V: CacheValue>(worker_id: usize, queue: &JobQueue<V>, job: Arc<Job<V>>) {
    let Some(fetch) = job.claim() else {
        return;
    };
    debug!(worker_id, job_id = job.id, key = %job.key, "Running job");

    let outcome = match AssertUnwindSafe(fetch()).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let cause: FetchCause = Arc::new(FetchPanicked(panic_message(panic.as_ref())));
            Err(cause)
        }
    };

    if let Err(cause) = &outcome {
        warn!(job_id = job.id, key = %job.key, error = %cause, "Fetch failed");
    }
    queue.complete(&job, outcome);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}

async fn reaper_loop<V: CacheValue>(
    queue: Arc<JobQueue<V>>,
    limiter: Arc<RateLimiter>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let jobs = queue.purge_expired();
                let windows = limiter.reap_idle();
                if jobs > 0 || windows > 0 {
                    debug!(jobs, windows, "Reaped expired state");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::CacheKey;
    use crate::config::{QueueConfig, RateLimitConfig};
    use crate::error::CacheError;
    use crate::jobs::job::{fetch_fn, JobState, Priority};
    use crate::metrics::CacheMetrics;

    fn setup(workers: usize) -> (Arc<JobQueue<String>>, WorkerPool<String>) {
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig {
            max_requests: 0,
            window_ms: 1_000,
        }));
        let queue = Arc::new(JobQueue::new(
            &QueueConfig::default(),
            limiter.clone(),
            Arc::new(CacheMetrics::new().unwrap()),
        ));
        let pool = WorkerPool::start(queue.clone(), workers, Duration::from_millis(50), limiter);
        (queue, pool)
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn test_worker_runs_job() {
        let (queue, pool) = setup(2);
        let handle = queue
            .submit(
                "u",
                CacheKey::new("k"),
                fetch_fn(|| async { Ok::<_, std::io::Error>("v".to_string()) }),
                Priority::Normal,
            )
            .unwrap();

        assert_eq!(handle.await_result(Duration::from_secs(1)).await.unwrap(), "v");
        assert_eq!(handle.state(), JobState::Completed);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_fetch_fails_job() {
        let (queue, pool) = setup(1);
        let handle = queue
            .submit(
                "u",
                CacheKey::new("k"),
                fetch_fn(|| async {
                    if true {
                        panic!("fetch exploded");
                    }
                    Ok::<_, std::io::Error>(String::new())
                }),
                Priority::Normal,
            )
            .unwrap();

        match handle.await_result(Duration::from_secs(1)).await {
            Err(CacheError::FetchFailed { source, .. }) => {
                assert!(source.to_string().contains("fetch exploded"))
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_jobs() {
        let (queue, pool) = setup(1);
        pool.shutdown().await;
        let err = queue.submit(
            "u",
            CacheKey::new("k"),
            fetch_fn(|| async { Ok::<_, std::io::Error>("v".to_string()) }),
            Priority::Normal,
        );
        assert!(matches!(err, Err(CacheError::ShuttingDown)));
    }
}
