//! Workload driver for the HPHA allocator.
//!
//! This crate provides:
//! - Stress: the multi-threaded random alloc/free scenario
//! - Churn: tree alloc/free/realloc with a coalescing check after every step
//! - Reports: configuration, counters and snapshots as JSON
//! - A stderr logger so the allocator's `log` output is visible

pub mod error;
pub mod logger;
pub mod report;
pub mod workload;

pub use error::HarnessError;
pub use report::{Outcome, RunReport};
pub use workload::{ChurnOptions, ChurnOutcome, StressOptions, StressOutcome};
