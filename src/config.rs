//! Runtime configuration for predictive-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All knobs (tier capacities, admission window, worker count, queue capacity,
//! retention, prediction weights) live here.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "predictive-cache", about = "Predictive tiered response cache service")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admin HTTP server configuration.
    pub server: ServerConfig,

    /// Hot/Warm tier configuration.
    pub tiers: TierConfig,

    /// Cold tier configuration.
    pub cold: ColdConfig,

    /// Per-identity admission control.
    pub rate_limit: RateLimitConfig,

    /// Job queue and worker pool.
    pub queue: QueueConfig,

    /// Predictive preloading.
    pub prefetch: PrefetchConfig,
}

/// Admin HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Simulated upstream latency for the lookup harness, in milliseconds.
    pub synthetic_upstream_latency_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            synthetic_upstream_latency_ms: 50,
        }
    }
}

/// Hot/Warm tier capacities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Maximum entries in the Hot tier.
    pub hot_capacity: usize,

    /// Maximum entries in the Warm tier.
    pub warm_capacity: usize,

    /// Optional byte budget for the Hot tier (enables size accounting).
    pub hot_max_bytes: Option<usize>,

    /// Optional byte budget for the Warm tier (enables size accounting).
    pub warm_max_bytes: Option<usize>,

    /// Number of key-hash shards the Hot/Warm tiers are split into.
    pub shards: usize,

    /// Optional entry time-to-live in seconds.
    pub entry_ttl_secs: Option<u64>,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            hot_capacity: 1_024,
            warm_capacity: 16_384,
            hot_max_bytes: None,
            warm_max_bytes: None,
            shards: 16,
            entry_ttl_secs: None,
        }
    }
}

impl TierConfig {
    pub fn entry_ttl(&self) -> Option<Duration> {
        self.entry_ttl_secs.map(Duration::from_secs)
    }
}

/// Cold (network-backed) tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColdConfig {
    /// Mount point of the shared store. `None` keeps the cold tier in memory.
    pub path: Option<PathBuf>,

    /// Per-operation timeout in milliseconds.
    pub op_timeout_ms: u64,

    /// Payloads at or above this many bytes are zstd-compressed.
    pub compress_threshold: usize,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for ColdConfig {
    fn default() -> Self {
        Self {
            path: None,
            op_timeout_ms: 250,
            compress_threshold: 4 * 1024,
            zstd_level: 3,
        }
    }
}

impl ColdConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

/// Per-identity admission window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Admissions allowed per window (0 = unlimited).
    pub max_requests: u32,

    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window_ms: 60_000,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Job queue and worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of concurrent workers.
    pub workers: usize,

    /// Maximum queued (pending) jobs before `QueueFull`.
    pub capacity: usize,

    /// How long `get` waits for a job result, in milliseconds.
    pub await_timeout_ms: u64,

    /// How long finished jobs stay queryable, in seconds.
    pub retention_secs: u64,

    /// Reaper period for finished jobs and idle admission windows, in milliseconds.
    pub reap_interval_ms: u64,

    /// A pending job waiting at least this long jumps ahead of higher priorities.
    pub starvation_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            capacity: 1_024,
            await_timeout_ms: 5_000,
            retention_secs: 300,
            reap_interval_ms: 10_000,
            starvation_ms: 2_000,
        }
    }
}

impl QueueConfig {
    pub fn await_timeout(&self) -> Duration {
        Duration::from_millis(self.await_timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn starvation(&self) -> Duration {
        Duration::from_millis(self.starvation_ms)
    }
}

/// Predictive preload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Schedule speculative jobs for predicted keys.
    pub enabled: bool,

    /// Number of recent keys remembered per identity.
    pub history_len: usize,

    /// Maximum predictions returned per lookup.
    pub max_predictions: usize,

    /// Weight of raw per-identity frequency.
    pub frequency_weight: f64,

    /// Weight of "this key usually follows the current key".
    pub sequence_weight: f64,

    /// Weight of hour-of-day co-occurrence.
    pub temporal_weight: f64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            history_len: 64,
            max_predictions: 3,
            frequency_weight: 0.3,
            sequence_weight: 0.5,
            temporal_weight: 0.2,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str::<Config>(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the cache cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.tiers.hot_capacity > 0, "tiers.hot_capacity must be > 0");
        anyhow::ensure!(self.tiers.warm_capacity > 0, "tiers.warm_capacity must be > 0");
        anyhow::ensure!(self.tiers.shards > 0, "tiers.shards must be > 0");
        anyhow::ensure!(self.queue.workers > 0, "queue.workers must be > 0");
        anyhow::ensure!(self.queue.capacity > 0, "queue.capacity must be > 0");
        anyhow::ensure!(self.rate_limit.window_ms > 0, "rate_limit.window_ms must be > 0");
        Ok(())
    }
}
