//! Per-method statistics and adaptive method fallback.

pub mod manager;
pub mod stats;

pub use manager::{RetryManager, RetryPolicy, ScanOutcome, ScanProvider};
pub use stats::MethodStatistics;
