//! Per-method success statistics.

use std::time::{Duration, SystemTime};

use access::AccessMethod;
use serde::{Deserialize, Serialize};

/// Success and failure counters for one access method.
///
/// `success_rate` and `average_duration` are recomputed on every update so
/// that a copy never shows counters and derived values out of step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodStatistics {
    pub method: AccessMethod,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_duration: Duration,
    pub average_duration: Duration,
    pub last_success_time: Option<SystemTime>,
    pub last_failure_time: Option<SystemTime>,
    /// `success / (success + failure)`, 0.0 before the first attempt.
    pub success_rate: f64,
}

impl MethodStatistics {
    pub fn new(method: AccessMethod) -> Self {
        Self {
            method,
            success_count: 0,
            failure_count: 0,
            total_duration: Duration::ZERO,
            average_duration: Duration::ZERO,
            last_success_time: None,
            last_failure_time: None,
            success_rate: 0.0,
        }
    }

    pub fn attempts(&self) -> u64 {
        self.success_count.saturating_add(self.failure_count)
    }

    pub fn record_success(&mut self, duration: Duration) {
        self.success_count = self.success_count.saturating_add(1);
        self.last_success_time = Some(SystemTime::now());
        self.add_duration(duration);
    }

    pub fn record_failure(&mut self, duration: Duration) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(SystemTime::now());
        self.add_duration(duration);
    }

    /// True when the method has failed more than `failure_threshold` times
    /// and succeeds less often than `success_rate_floor`.
    pub fn is_chronically_failing(&self, failure_threshold: u64, success_rate_floor: f64) -> bool {
        self.failure_count > failure_threshold && self.success_rate < success_rate_floor
    }

    /// One-line rendering for error context and the `stats` command.
    pub fn summary(&self) -> String {
        format!(
            "success={} failure={} rate={:.2} avg={}ms",
            self.success_count,
            self.failure_count,
            self.success_rate,
            self.average_duration.as_millis()
        )
    }

    fn add_duration(&mut self, duration: Duration) {
        self.total_duration = self.total_duration.saturating_add(duration);
        let attempts = self.attempts();
        self.success_rate = self.success_count as f64 / attempts as f64;
        self.average_duration = self.total_duration / u32::try_from(attempts).unwrap_or(u32::MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_statistics_are_empty() {
        let stats = MethodStatistics::new(AccessMethod::ShellAutomation);
        assert_eq!(stats.attempts(), 0);
        assert_eq!(stats.success_rate, 0.0);
        assert!(!stats.is_chronically_failing(0, 0.1));
    }

    #[test]
    fn test_rate_and_average() {
        let mut stats = MethodStatistics::new(AccessMethod::MetadataQuery);
        stats.record_failure(Duration::from_millis(100));
        stats.record_success(Duration::from_millis(300));
        stats.record_success(Duration::from_millis(200));

        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.failure_count, 1);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.total_duration, Duration::from_millis(600));
        assert_eq!(stats.average_duration, Duration::from_millis(200));
        assert!(stats.last_success_time.is_some());
        assert!(stats.last_failure_time.is_some());
    }

    #[test]
    fn test_chronic_failure_needs_both_conditions() {
        let mut stats = MethodStatistics::new(AccessMethod::DirectFilesystem);
        for _ in 0..10 {
            stats.record_failure(Duration::ZERO);
        }
        // Exactly at the threshold is not over it.
        assert!(!stats.is_chronically_failing(10, 0.1));

        stats.record_failure(Duration::ZERO);
        assert!(stats.is_chronically_failing(10, 0.1));

        // Enough successes lift the rate over the floor.
        for _ in 0..2 {
            stats.record_success(Duration::ZERO);
        }
        assert!(!stats.is_chronically_failing(10, 0.1));
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut stats = MethodStatistics::new(AccessMethod::ShellAutomation);
        stats.record_success(Duration::from_millis(5));
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"shell_automation\""));
        let back: MethodStatistics = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats);
    }
}
