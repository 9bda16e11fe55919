//! Predictive preloading: learns which keys each identity asks for and
//! suggests the keys it is likely to ask for next.
//!
//! Three signals are blended into one score per candidate:
//! 1. Frequency: how often the identity requested the key
//! 2. Sequence: how often (and how recently) the key followed the current key
//! 3. Temporal: how often the key was requested in the current hour-of-day
//!
//! Predictions are advisory. Unknown identities, empty histories and
//! degenerate weights all yield an empty list rather than an error.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::trace;

use crate::cache::entry::CacheKey;
use crate::config::PrefetchConfig;

const HOURS: usize = 24;

/// How often `next` followed a given key, and when it last did.
#[derive(Debug, Clone, Copy, Default)]
struct Successor {
    count: u64,
    last_seq: u64,
}

/// Per-identity access history.
#[derive(Debug, Default)]
pub struct QueryHistory {
    recent: VecDeque<CacheKey>,
    frequency: HashMap<CacheKey, u64>,
    successors: HashMap<CacheKey, HashMap<CacheKey, Successor>>,
    hours: HashMap<CacheKey, [u32; HOURS]>,
    /// Total accesses recorded; doubles as a logical clock for recency.
    seq: u64,
}

impl QueryHistory {
    fn record(&mut self, key: &CacheKey, hour: usize, max_len: usize) {
        self.seq += 1;

        if let Some(prev) = self.recent.back() {
            if prev != key {
                let succ = self
                    .successors
                    .entry(prev.clone())
                    .or_default()
                    .entry(key.clone())
                    .or_default();
                succ.count += 1;
                succ.last_seq = self.seq;
            }
        }

        *self.frequency.entry(key.clone()).or_insert(0) += 1;
        self.hours.entry(key.clone()).or_insert([0; HOURS])[hour % HOURS] += 1;

        self.recent.push_back(key.clone());
        while self.recent.len() > max_len {
            self.recent.pop_front();
        }

        // Keep the statistics maps proportional to the window.
        if self.frequency.len() > max_len.saturating_mul(4).max(16) {
            self.forget_stale();
        }
    }

    /// Drop statistics for keys that fell out of the recent window.
    fn forget_stale(&mut self) {
        let live: std::collections::HashSet<&CacheKey> = self.recent.iter().collect();
        self.frequency.retain(|k, _| live.contains(k));
        self.hours.retain(|k, _| live.contains(k));
        self.successors.retain(|k, _| live.contains(k));
        for next in self.successors.values_mut() {
            next.retain(|k, _| live.contains(k));
        }
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    pub fn recent(&self) -> impl Iterator<Item = &CacheKey> {
        self.recent.iter()
    }

    pub fn frequency(&self, key: &CacheKey) -> u64 {
        self.frequency.get(key).copied().unwrap_or(0)
    }
}

/// A predicted key and its blended score.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub key: CacheKey,
    pub score: f64,
}

/// Learns per-identity query patterns.
pub struct PredictiveLoader {
    config: PrefetchConfig,
    histories: DashMap<String, QueryHistory>,
}

impl PredictiveLoader {
    pub fn new(config: PrefetchConfig) -> Self {
        Self {
            config,
            histories: DashMap::new(),
        }
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.config
    }

    /// Record that `identity` requested `key` now.
    pub fn record_access(&self, identity: &str, key: &CacheKey) {
        self.record_access_at(identity, key, current_hour());
    }

    /// [`record_access`](Self::record_access) in an explicit hour-of-day bucket.
    pub fn record_access_at(&self, identity: &str, key: &CacheKey, hour: usize) {
        let max_len = self.config.history_len.max(1);
        self.histories
            .entry(identity.to_owned())
            .or_default()
            .record(key, hour, max_len);
    }

    /// Up to `max_predictions` keys `identity` is likely to request after
    /// `current`, best first. `current` is never included.
    pub fn predict(&self, identity: &str, current: &CacheKey) -> Vec<CacheKey> {
        self.predict_at(identity, current, current_hour())
            .into_iter()
            .map(|p| p.key)
            .collect()
    }

    /// Scored predictions for an explicit hour-of-day bucket.
    pub fn predict_at(&self, identity: &str, current: &CacheKey, hour: usize) -> Vec<Prediction> {
        let limit = self.config.max_predictions;
        if limit == 0 {
            return Vec::new();
        }
        let Some(history) = self.histories.get(identity) else {
            return Vec::new();
        };

        let hour = hour % HOURS;
        let max_freq = history.frequency.values().copied().max().unwrap_or(0);
        if max_freq == 0 {
            return Vec::new();
        }
        let max_hour = history
            .hours
            .values()
            .map(|h| h[hour])
            .max()
            .unwrap_or(0);

        let successors = history.successors.get(current);
        let max_succ = successors
            .and_then(|s| s.values().map(|v| v.count).max())
            .unwrap_or(0);

        let mut scored: Vec<Prediction> = history
            .frequency
            .iter()
            .filter(|(key, _)| *key != current)
            .map(|(key, &freq)| {
                let frequency = freq as f64 / max_freq as f64;

                let sequence = match successors.and_then(|s| s.get(key)) {
                    Some(succ) if max_succ > 0 => {
                        let count = succ.count as f64 / max_succ as f64;
                        let recency = succ.last_seq as f64 / history.seq.max(1) as f64;
                        0.7 * count + 0.3 * recency
                    }
                    _ => 0.0,
                };

                let temporal = match (history.hours.get(key), max_hour) {
                    (Some(h), max) if max > 0 => h[hour] as f64 / max as f64,
                    _ => 0.0,
                };

                let score = self.config.frequency_weight * frequency
                    + self.config.sequence_weight * sequence
                    + self.config.temporal_weight * temporal;
                Prediction {
                    key: key.clone(),
                    score,
                }
            })
            .filter(|p| p.score.is_finite() && p.score > 0.0)
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        scored.truncate(limit);

        trace!(identity, current = %current, predicted = scored.len(), "Predicted next keys");
        scored
    }

    /// Number of identities with recorded history.
    pub fn identities(&self) -> usize {
        self.histories.len()
    }

    /// Recent keys remembered for `identity`, oldest first.
    pub fn history(&self, identity: &str) -> Vec<CacheKey> {
        self.histories
            .get(identity)
            .map(|h| h.recent().cloned().collect())
            .unwrap_or_default()
    }
}

/// Current UTC hour of day.
fn current_hour() -> usize {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| ((d.as_secs() / 3600) % HOURS as u64) as usize)
        .unwrap_or(0)
}
