//! Per-identity admission control.
//!
//! Each identity gets a window of `window` duration admitting at most
//! `max_requests` submissions. Windows roll forward lazily on the next call
//! once they have elapsed; `reap_idle` bounds memory by dropping windows
//! untouched for two window lengths.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::config::RateLimitConfig;

/// Admission state for one identity.
#[derive(Debug, Clone, Copy)]
struct IdentityWindow {
    window_start: Instant,
    request_count: u32,
    last_seen: Instant,
}

/// Point-in-time view of one identity's window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterSnapshot {
    pub limit: u32,
    pub remaining: u32,
    /// Time until the current window rolls over.
    pub resets_in: Duration,
}

pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    windows: DashMap<String, IdentityWindow>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            window: config.window(),
            windows: DashMap::new(),
        }
    }

    /// Admit one request for `identity`, or refuse without side effects.
    pub fn allow(&self, identity: &str) -> bool {
        self.allow_at(identity, Instant::now())
    }

    /// [`allow`](Self::allow) at an explicit instant.
    pub fn allow_at(&self, identity: &str, now: Instant) -> bool {
        if self.max_requests == 0 {
            return true;
        }

        // The entry guard holds the shard lock: check and increment happen
        // in one critical section.
        let mut window = self
            .windows
            .entry(identity.to_owned())
            .or_insert_with(|| IdentityWindow {
                window_start: now,
                request_count: 0,
                last_seen: now,
            });

        if now.saturating_duration_since(window.window_start) >= self.window {
            window.window_start = now;
            window.request_count = 0;
        }
        window.last_seen = now;

        if window.request_count >= self.max_requests {
            debug!(identity, count = window.request_count, "Admission denied");
            return false;
        }
        window.request_count += 1;
        true
    }

    /// Remaining admissions for `identity` in its current window.
    pub fn snapshot(&self, identity: &str) -> RateLimiterSnapshot {
        self.snapshot_at(identity, Instant::now())
    }

    pub fn snapshot_at(&self, identity: &str, now: Instant) -> RateLimiterSnapshot {
        let full = RateLimiterSnapshot {
            limit: self.max_requests,
            remaining: self.max_requests,
            resets_in: Duration::ZERO,
        };

        match self.windows.get(identity) {
            Some(w) => {
                let elapsed = now.saturating_duration_since(w.window_start);
                if elapsed >= self.window {
                    return full;
                }
                RateLimiterSnapshot {
                    limit: self.max_requests,
                    remaining: self.max_requests.saturating_sub(w.request_count),
                    resets_in: self.window - elapsed,
                }
            }
            None => full,
        }
    }

    /// Drop windows idle for at least two window lengths. Returns how many.
    pub fn reap_idle(&self) -> usize {
        self.reap_idle_at(Instant::now())
    }

    pub fn reap_idle_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        let idle_after = self.window * 2;
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.last_seen) < idle_after);
        before.saturating_sub(self.windows.len())
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}
