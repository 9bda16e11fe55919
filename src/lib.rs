//! predictive-cache: tiered response cache with a background job pipeline.
//!
//! Lookups go through a hierarchy of tiers:
//!   Hot (RAM) → Warm (RAM) → Cold (network store)
//!
//! Misses are fetched by a fixed worker pool under per-identity admission
//! control, with concurrent requests for one key coalesced onto one fetch.
//! A per-identity access model schedules speculative preloads.

pub mod cache;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod orchestrator;
pub mod rate_limiter;
pub mod server;

pub use cache::entry::{CacheKey, CacheValue, Tier};
pub use error::{CacheError, Result};
pub use jobs::job::{fetch_fn, FetchFn, Priority};
pub use orchestrator::{CacheOrchestrator, PreloadResolver};
