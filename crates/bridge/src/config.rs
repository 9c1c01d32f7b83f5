//! Configuration management for devbridge.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/devbridge/config.toml`.
//! The core components never read this file; they receive the plain values
//! produced by [`TransferConfig::options`] and [`RetryConfig::policy`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::transfer::TransferOptions;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("chunk_size must be between 1 and {max} bytes, got {0}", max = MAX_CHUNK_SIZE)]
    InvalidChunkSize(u64),

    #[error("checkpoint_interval must be greater than 0, got {0}")]
    InvalidCheckpointInterval(u64),

    #[error("max_concurrency must be between 1 and 64, got {0}")]
    InvalidMaxConcurrency(usize),

    #[error("success_rate_floor must be between 0.0 and 1.0, got {0}")]
    InvalidSuccessRateFloor(f64),

    #[error("max_rounds must be between 1 and 20, got {0}")]
    InvalidMaxRounds(u32),

    #[error("command timeout for {0} must be greater than 0")]
    InvalidCommandTimeout(&'static str),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Largest accepted chunk size (64MB).
const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Main configuration structure for devbridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General settings.
    pub general: GeneralConfig,

    /// Chunked transfer settings.
    pub transfer: TransferConfig,

    /// Adaptive method selection settings.
    pub retry: RetryConfig,

    /// Path resolver settings.
    pub resolvers: ResolverConfig,

    /// Channel command settings.
    pub channels: ChannelsConfig,

    /// Devices declared by hand, in addition to the ones the host reports.
    pub devices: Vec<DeviceConfig>,
}

/// General configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory for checkpoints and method statistics.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional file receiving a copy of the log output.
    pub log_file: Option<PathBuf>,
}

/// Chunked transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes read from the device per chunk (default: 1MB).
    pub chunk_size: u64,

    /// Bytes copied between two persisted checkpoints (default: 4MB).
    pub checkpoint_interval: u64,

    /// Number of files copied in parallel.
    pub max_concurrency: usize,

    /// Age after which orphaned checkpoints are reclaimed (default: 7 days).
    pub checkpoint_max_age_secs: u64,

    /// Digest algorithm name (sha256, sha512, md5, crc32).
    pub digest_algorithm: String,

    /// Overwrite files already present at the destination.
    pub overwrite: bool,

    /// File extensions considered target types (lowercase, no dot).
    pub target_extensions: Vec<String>,

    /// Only transfer files whose extension is a target type.
    pub only_target_types: bool,
}

/// Adaptive method selection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Failures a method may accumulate before it can be excluded.
    pub failure_threshold: u64,

    /// Success rate below which a method over the threshold is excluded.
    pub success_rate_floor: f64,

    /// Passes over the method list before giving up.
    pub max_rounds: u32,

    /// Delay before the second pass, in milliseconds.
    pub initial_backoff_ms: u64,

    /// Upper bound for the delay between passes, in milliseconds.
    pub max_backoff_ms: u64,

    /// Persist method statistics between runs.
    pub persist_statistics: bool,
}

/// Path resolver configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResolverConfig {
    /// Directories searched for the device's mount point.
    pub mount_roots: Vec<PathBuf>,

    /// Static priority per method; higher is tried first.
    pub priorities: MethodPriorities,
}

/// Static priority for each access method.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MethodPriorities {
    pub direct_filesystem: i32,
    pub shell_automation: i32,
    pub metadata_query: i32,
}

/// Channel command configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ChannelsConfig {
    pub shell: ShellChannelConfig,
    pub metadata: MetadataChannelConfig,
}

/// Shell automation channel.
///
/// Arguments may contain `{device}`, `{vendor_id}`, `{product_id}`,
/// `{handle}` and `{path}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShellChannelConfig {
    /// Program to run (looked up on PATH).
    pub program: String,

    /// Prints the device handle on its first output line. Optional.
    pub resolve_args: Vec<String>,

    /// Exits 0 when the device is reachable. Optional.
    pub connect_args: Vec<String>,

    /// Prints `relative_path<TAB>size<TAB>mtime` lines. Required.
    pub list_args: Vec<String>,

    /// Writes the file at `{path}` to stdout. Required.
    pub fetch_args: Vec<String>,

    /// Timeout for resolve/connect/list commands.
    pub timeout_secs: u64,
}

/// Metadata query channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetadataChannelConfig {
    /// Program to run (looked up on PATH). Empty disables the channel.
    pub program: String,

    /// Prints the file listing as JSON.
    pub query_args: Vec<String>,

    /// Writes the file at `{path}` to stdout.
    pub fetch_args: Vec<String>,

    /// Timeout for query commands.
    pub timeout_secs: u64,
}

/// A device declared in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    pub vendor_id: String,
    pub product_id: String,
    pub handle: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,               // 1MB
            checkpoint_interval: 4 * 1024 * 1024, // 4MB
            max_concurrency: 4,
            checkpoint_max_age_secs: 7 * 24 * 60 * 60,
            digest_algorithm: "sha256".to_string(),
            overwrite: false,
            target_extensions: default_target_extensions(),
            only_target_types: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            success_rate_floor: 0.1,
            max_rounds: 1,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            persist_statistics: true,
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            mount_roots: default_mount_roots(),
            priorities: MethodPriorities::default(),
        }
    }
}

impl Default for MethodPriorities {
    fn default() -> Self {
        Self {
            direct_filesystem: 30,
            shell_automation: 20,
            metadata_query: 10,
        }
    }
}

impl Default for ShellChannelConfig {
    fn default() -> Self {
        Self {
            program: "sh".to_string(),
            resolve_args: Vec::new(),
            connect_args: Vec::new(),
            list_args: Vec::new(),
            fetch_args: Vec::new(),
            timeout_secs: 30,
        }
    }
}

impl Default for MetadataChannelConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            query_args: Vec::new(),
            fetch_args: Vec::new(),
            timeout_secs: 60,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devbridge")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devbridge")
}

/// Returns the mount roots searched by default on this platform.
fn default_mount_roots() -> Vec<PathBuf> {
    if cfg!(target_os = "macos") {
        return vec![PathBuf::from("/Volumes")];
    }

    let mut roots = Vec::new();
    if let Ok(user) = std::env::var("USER") {
        if !user.is_empty() {
            roots.push(PathBuf::from("/run/media").join(&user));
            roots.push(PathBuf::from("/media").join(&user));
        }
    }
    roots.push(PathBuf::from("/media"));
    roots.push(PathBuf::from("/mnt"));
    roots
}

fn default_target_extensions() -> Vec<String> {
    [
        "jpg", "jpeg", "heic", "heif", "png", "dng", "raw", "cr2", "nef", "arw", "mov", "mp4",
        "m4v", "avi",
    ]
    .iter()
    .map(|ext| ext.to_string())
    .collect()
}

impl GeneralConfig {
    /// Directory holding resume records.
    pub fn resume_dir(&self) -> PathBuf {
        self.data_dir.join("resume")
    }

    /// File holding persisted method statistics.
    pub fn statistics_path(&self) -> PathBuf {
        self.data_dir.join("method_stats.json")
    }
}

impl TransferConfig {
    /// Plain transfer settings consumed by the transfer engine.
    pub fn options(&self) -> TransferOptions {
        TransferOptions {
            chunk_size: self.chunk_size,
            checkpoint_interval: self.checkpoint_interval,
            overwrite: self.overwrite,
        }
    }

    /// Maximum checkpoint age before the expiry sweep reclaims it.
    pub fn checkpoint_max_age(&self) -> Duration {
        Duration::from_secs(self.checkpoint_max_age_secs)
    }
}

impl RetryConfig {
    /// Plain selection policy consumed by the retry manager.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            failure_threshold: self.failure_threshold,
            success_rate_floor: self.success_rate_floor,
            max_rounds: self.max_rounds,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - DEVBRIDGE_DATA_DIR: Override the data directory
    /// - DEVBRIDGE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("DEVBRIDGE_DATA_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding data_dir from environment: {}", dir);
                self.general.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(level) = std::env::var("DEVBRIDGE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.general.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let transfer = &self.transfer;
        if transfer.chunk_size == 0 || transfer.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::InvalidChunkSize(transfer.chunk_size));
        }

        if transfer.checkpoint_interval == 0 {
            return Err(ConfigError::InvalidCheckpointInterval(
                transfer.checkpoint_interval,
            ));
        }

        if transfer.max_concurrency < 1 || transfer.max_concurrency > 64 {
            return Err(ConfigError::InvalidMaxConcurrency(transfer.max_concurrency));
        }

        let floor = self.retry.success_rate_floor;
        if !(0.0..=1.0).contains(&floor) {
            return Err(ConfigError::InvalidSuccessRateFloor(floor));
        }

        if self.retry.max_rounds < 1 || self.retry.max_rounds > 20 {
            return Err(ConfigError::InvalidMaxRounds(self.retry.max_rounds));
        }

        if self.channels.shell.timeout_secs == 0 {
            return Err(ConfigError::InvalidCommandTimeout("channels.shell"));
        }
        if self.channels.metadata.timeout_secs == 0 {
            return Err(ConfigError::InvalidCommandTimeout("channels.metadata"));
        }

        let level = self.general.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.general.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
