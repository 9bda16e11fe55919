//! Error taxonomy for the cache core.
//!
//! `StoreUnavailable` never leaves [`crate::cache::store::CacheStore`]; the
//! other variants surface to `get` callers, which decide how to degrade.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::cache::entry::CacheKey;
use crate::jobs::job::JobId;

/// Shared cause of a failed fetch. Many waiters may observe one failure.
pub type FetchCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Message shown to end users for any core failure.
pub const USER_MESSAGE: &str = "This is temporarily unavailable, please try again in a moment.";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("admission denied for identity {identity}: rate limit exceeded")]
    AdmissionDenied { identity: String },

    #[error("job queue is full ({capacity} pending jobs)")]
    QueueFull { capacity: usize },

    #[error("job {job_id} not ready after {waited:?}")]
    AwaitTimeout { job_id: JobId, waited: Duration },

    #[error("fetch failed for key {key}: {source}")]
    FetchFailed {
        key: CacheKey,
        #[source]
        source: FetchCause,
    },

    #[error("cold store unavailable during {op}: {reason}")]
    StoreUnavailable { op: &'static str, reason: String },

    #[error("worker pool is shutting down")]
    ShuttingDown,
}

impl CacheError {
    /// Single generic message for chat-facing replies.
    pub fn user_message(&self) -> &'static str {
        USER_MESSAGE
    }

    /// Whether a later attempt by the caller may succeed without any change.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CacheError::FetchFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_failed_keeps_source() {
        let cause: FetchCause = Arc::new(std::io::Error::other("upstream 502"));
        let err = CacheError::FetchFailed {
            key: CacheKey::new("price:btc"),
            source: cause,
        };
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "upstream 502");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_all_variants_share_user_message() {
        let errs = [
            CacheError::AdmissionDenied { identity: "u1".into() },
            CacheError::QueueFull { capacity: 4 },
            CacheError::ShuttingDown,
        ];
        for err in errs {
            assert_eq!(err.user_message(), USER_MESSAGE);
            assert!(err.is_retryable());
        }
    }
}
