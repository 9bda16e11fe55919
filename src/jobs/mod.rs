//! Background job pipeline.
//!
//! - [`job`]: Job state machine, priorities and handles
//! - [`queue`]: Admission, coalescing and priority scheduling
//! - [`pool`]: Worker pool and reaper

pub mod job;
pub mod pool;
pub mod queue;
