//! Adaptive access method selection.
//!
//! The [`RetryManager`] walks a provider's preferred methods in order, skips
//! methods whose statistics show chronic failure, records every attempt and
//! stops at the first success. Statistics can be persisted so that a method
//! that never works stays excluded across runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use access::{AccessMethod, AccessResult, BridgeError, ErrorCode, RemoteFileEntry, Result};
use serde::{Deserialize, Serialize};

use super::stats::MethodStatistics;
use crate::transfer::resume::write_atomic;

/// Multiplier applied to the delay after each round.
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Thresholds and pacing for method selection.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Failures a method may accumulate before it can be excluded.
    pub failure_threshold: u64,
    /// Success rate below which a method over the threshold is excluded.
    pub success_rate_floor: f64,
    /// Passes over the method list.
    pub max_rounds: u32,
    /// Delay before the second pass.
    pub initial_backoff: Duration,
    /// Upper bound for the delay between passes.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            success_rate_floor: 0.1,
            max_rounds: 1,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before pass `round` (0-based); the first pass has none.
    pub fn backoff_for(&self, round: u32) -> Duration {
        if round == 0 {
            return Duration::ZERO;
        }
        let factor = BACKOFF_MULTIPLIER.powi(round.saturating_sub(1) as i32);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Something that can list a device's files through a chosen method.
///
/// [`DeviceBridge`](crate::devices::DeviceBridge) is the production
/// implementation.
pub trait ScanProvider: Send + Sync {
    /// Methods to try, most preferred first.
    fn preferred_methods(&self) -> Vec<AccessMethod>;

    /// Fails when `device_name` is not attached.
    ///
    /// Runs once before any method is tried, so an absent device never
    /// counts against a method.
    fn check_device(&self, _device_name: &str) -> Result<()> {
        Ok(())
    }

    /// Lists files of `device_name` under `base_path` using `method` only.
    fn scan_with_method(
        &self,
        method: AccessMethod,
        device_name: &str,
        base_path: &str,
    ) -> Result<Vec<RemoteFileEntry>>;
}

/// Result of a successful scan.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub method: AccessMethod,
    pub entries: Vec<RemoteFileEntry>,
}

#[derive(Default)]
struct RetryState {
    stats: BTreeMap<AccessMethod, MethodStatistics>,
    last_results: BTreeMap<AccessMethod, AccessResult>,
}

/// Wrapper for serializing method statistics.
#[derive(Debug, Serialize, Deserialize)]
struct StatisticsFile {
    /// Version of the file format (for future migrations).
    version: u32,
    methods: Vec<MethodStatistics>,
}

/// Tracks per-method statistics and drives method fallback.
pub struct RetryManager {
    policy: RetryPolicy,
    state: Mutex<RetryState>,
    stats_path: Option<PathBuf>,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(RetryState::default()),
            stats_path: None,
        }
    }

    /// Creates a manager whose statistics are loaded from and saved to `path`.
    ///
    /// A missing file starts empty; an unreadable one is logged and ignored.
    pub fn with_persistence<P: AsRef<Path>>(policy: RetryPolicy, path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let manager = Self {
            policy,
            state: Mutex::new(RetryState::default()),
            stats_path: Some(path.clone()),
        };
        match load_statistics(&path) {
            Ok(methods) => {
                let mut state = manager.lock();
                for stats in methods {
                    state.stats.insert(stats.method, stats);
                }
                if !state.stats.is_empty() {
                    tracing::debug!(
                        "Loaded statistics for {} methods from {:?}",
                        state.stats.len(),
                        path
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Ignoring unreadable method statistics"
                );
            }
        }
        manager
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, RetryState> {
        // Statistics stay usable even if a holder panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records one attempt: updates the method's counters and keeps the
    /// result as that method's latest.
    pub fn record(&self, result: &AccessResult) {
        let mut state = self.lock();
        let stats = state
            .stats
            .entry(result.method)
            .or_insert_with(|| MethodStatistics::new(result.method));
        if result.success {
            stats.record_success(result.duration);
        } else {
            stats.record_failure(result.duration);
        }
        tracing::debug!(
            method = %result.method,
            success = result.success,
            rate = stats.success_rate,
            "Recorded access attempt"
        );
        state.last_results.insert(result.method, result.clone());
    }

    /// Whether `method` is currently excluded by its statistics.
    pub fn should_skip(&self, method: AccessMethod) -> bool {
        self.lock().stats.get(&method).is_some_and(|stats| {
            stats.is_chronically_failing(
                self.policy.failure_threshold,
                self.policy.success_rate_floor,
            )
        })
    }

    /// Copies of all statistics, ordered by method.
    pub fn statistics(&self) -> Vec<MethodStatistics> {
        self.lock().stats.values().cloned().collect()
    }

    pub fn method_statistics(&self, method: AccessMethod) -> Option<MethodStatistics> {
        self.lock().stats.get(&method).cloned()
    }

    /// Copies of the latest result per method.
    pub fn last_results(&self) -> Vec<AccessResult> {
        self.lock().last_results.values().cloned().collect()
    }

    /// Forgets everything recorded about `method`.
    pub fn reset(&self, method: AccessMethod) {
        let mut state = self.lock();
        state.stats.remove(&method);
        state.last_results.remove(&method);
        tracing::info!(method = %method, "Statistics reset");
    }

    pub fn reset_all(&self) {
        let mut state = self.lock();
        state.stats.clear();
        state.last_results.clear();
    }

    /// Lists files using the first method that works.
    pub fn scan_with_retry(
        &self,
        provider: &dyn ScanProvider,
        device_name: &str,
        base_path: &str,
    ) -> Result<Vec<RemoteFileEntry>> {
        self.scan_with_retry_detailed(provider, device_name, base_path)
            .map(|outcome| outcome.entries)
    }

    /// Like [`scan_with_retry`](Self::scan_with_retry), also reporting which
    /// method produced the listing.
    pub fn scan_with_retry_detailed(
        &self,
        provider: &dyn ScanProvider,
        device_name: &str,
        base_path: &str,
    ) -> Result<ScanOutcome> {
        provider.check_device(device_name)?;

        let methods = provider.preferred_methods();
        if methods.is_empty() {
            return Err(BridgeError::not_supported("no access methods available")
                .with_context("device", device_name));
        }

        let rounds = self.policy.max_rounds.max(1);
        let mut attempts: Vec<AccessResult> = Vec::new();
        let mut last_error: Option<BridgeError> = None;

        for round in 0..rounds {
            if round > 0 {
                let delay = self.policy.backoff_for(round);
                tracing::info!(round = round + 1, "Retrying scan in {:?}", delay);
                std::thread::sleep(delay);
            }

            let mut tried = false;
            for &method in &methods {
                if self.should_skip(method) {
                    tracing::debug!(method = %method, "Skipping chronically failing method");
                    continue;
                }
                tried = true;

                let start = Instant::now();
                match provider.scan_with_method(method, device_name, base_path) {
                    Ok(entries) => {
                        self.record(&AccessResult::succeeded(method, device_name, start.elapsed()));
                        self.persist();
                        tracing::info!(method = %method, files = entries.len(), "Scan succeeded");
                        return Ok(ScanOutcome { method, entries });
                    }
                    Err(e) => {
                        let result = AccessResult::failed(method, device_name, start.elapsed(), &e);
                        tracing::warn!(method = %method, error = %e, "Scan attempt failed");
                        self.record(&result);
                        attempts.push(result);
                        last_error = Some(e);
                    }
                }
            }

            if !tried {
                break;
            }
        }

        self.persist();

        let error = match last_error {
            Some(e) => e,
            None => BridgeError::not_supported(
                "all access methods are excluded by their failure statistics",
            ),
        };
        Err(self.annotate_exhaustion(error, device_name, &attempts))
    }

    /// Adds the per-attempt breakdown and a statistics dump to `error`.
    pub fn annotate_exhaustion(
        &self,
        error: BridgeError,
        device_name: &str,
        attempts: &[AccessResult],
    ) -> BridgeError {
        let mut error = error.with_context("device", device_name);
        for (n, attempt) in attempts.iter().enumerate() {
            error = error.with_context(
                format!("attempt.{}.{}", n + 1, attempt.method),
                attempt.summary(),
            );
        }
        for stats in self.statistics() {
            error = error.with_context(format!("statistics.{}", stats.method), stats.summary());
        }
        error
    }

    /// Saves statistics if persistence is enabled. Failures are logged.
    pub fn persist(&self) {
        if let Err(e) = self.save() {
            tracing::warn!(error = %e, "Failed to save method statistics");
        }
    }

    /// Saves statistics if persistence is enabled.
    ///
    /// Uses a synced temp file and a rename.
    pub fn save(&self) -> Result<()> {
        let Some(ref path) = self.stats_path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let data = StatisticsFile {
            version: 1,
            methods: self.statistics(),
        };
        let contents = serde_json::to_vec_pretty(&data)?;

        write_atomic(path, &contents)
            .map_err(|e| BridgeError::from(e).with_context("path", path.display()))?;

        tracing::debug!("Saved method statistics to {:?}", path);
        Ok(())
    }
}

fn load_statistics(path: &Path) -> Result<Vec<MethodStatistics>> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let data: StatisticsFile = serde_json::from_slice(&contents)?;
    if data.version != 1 {
        return Err(BridgeError::new(
            ErrorCode::InvalidParameter,
            format!("unsupported statistics version {}", data.version),
        ));
    }
    Ok(data.methods)
}
