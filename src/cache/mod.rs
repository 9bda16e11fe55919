//! Tiered response cache.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`entry`]: CacheKey, CacheValue, CacheEntry, Tier definitions
//! - [`tier`]: One bounded LRU tier
//! - [`evictor`]: Entry and byte budgets, LRU victim selection
//! - [`store`]: Tier manager that orchestrates lookup, promotion and demotion
//! - [`cold`]: Cold tier backends (in-memory, mounted filesystem)
//! - [`compressor`]: Cold payload encoding with zstd compression
//! - [`prefetcher`]: Per-identity predictions for speculative preloads

pub mod cold;
pub mod compressor;
pub mod entry;
pub mod evictor;
pub mod prefetcher;
pub mod store;
pub mod tier;
