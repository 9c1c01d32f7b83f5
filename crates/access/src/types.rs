//! Data model shared by channels, resolvers and the transfer engine.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Identifies the target device. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct DeviceDescriptor {
    /// Human-readable device name (what the user asks for).
    pub display_name: String,
    /// USB vendor ID as reported by the host, lowercase hex.
    pub vendor_id: String,
    /// USB product ID as reported by the host, lowercase hex.
    pub product_id: String,
    /// Host-specific handle (sysfs path, bus address, ...). May be empty.
    pub native_handle: String,
}

impl DeviceDescriptor {
    pub fn new(
        display_name: impl Into<String>,
        vendor_id: impl Into<String>,
        product_id: impl Into<String>,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            vendor_id: vendor_id.into(),
            product_id: product_id.into(),
            native_handle: String::new(),
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.native_handle = handle.into();
        self
    }

    /// Returns true if both IDs are set and equal to the given pair.
    pub fn matches_ids(&self, vendor_id: &str, product_id: &str) -> bool {
        !vendor_id.is_empty()
            && !product_id.is_empty()
            && self.vendor_id.eq_ignore_ascii_case(vendor_id)
            && self.product_id.eq_ignore_ascii_case(product_id)
    }
}

/// Which channel implementation produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMethod {
    /// Scripted automation driven through a shell program.
    ShellAutomation,
    /// Device-management metadata queries.
    MetadataQuery,
    /// Direct filesystem access to a transient mount point.
    DirectFilesystem,
}

impl AccessMethod {
    /// Returns all access methods.
    pub fn all() -> &'static [AccessMethod] {
        &[
            AccessMethod::DirectFilesystem,
            AccessMethod::ShellAutomation,
            AccessMethod::MetadataQuery,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccessMethod::ShellAutomation => "shell_automation",
            AccessMethod::MetadataQuery => "metadata_query",
            AccessMethod::DirectFilesystem => "direct_filesystem",
        }
    }
}

impl fmt::Display for AccessMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessMethod {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "shell_automation" | "shell" => Ok(AccessMethod::ShellAutomation),
            "metadata_query" | "metadata" => Ok(AccessMethod::MetadataQuery),
            "direct_filesystem" | "filesystem" | "fs" => Ok(AccessMethod::DirectFilesystem),
            other => Err(BridgeError::invalid_parameter(format!(
                "unknown access method: {other}"
            ))),
        }
    }
}

/// Outcome of one access attempt. Only the latest per method is retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessResult {
    pub method: AccessMethod,
    pub success: bool,
    /// Path or handle the attempt worked against (empty if resolution failed).
    pub device_path: String,
    pub duration: Duration,
    /// Rendered error for failed attempts.
    pub error: Option<String>,
}

impl AccessResult {
    pub fn succeeded(
        method: AccessMethod,
        device_path: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            method,
            success: true,
            device_path: device_path.into(),
            duration,
            error: None,
        }
    }

    pub fn failed(
        method: AccessMethod,
        device_path: impl Into<String>,
        duration: Duration,
        error: &BridgeError,
    ) -> Self {
        Self {
            method,
            success: false,
            device_path: device_path.into(),
            duration,
            error: Some(error.to_string()),
        }
    }

    /// One-line summary used in aggregate error context.
    pub fn summary(&self) -> String {
        let status = if self.success { "ok" } else { "failed" };
        let mut line = format!("{} in {}ms", status, self.duration.as_millis());
        if !self.device_path.is_empty() {
            line.push_str(&format!(" at {}", self.device_path));
        }
        if let Some(ref err) = self.error {
            line.push_str(&format!(": {err}"));
        }
        line
    }
}

/// How trustworthy a reported file size is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SizeSource {
    /// The channel measured the size; it can be used as the transfer total.
    #[default]
    Measured,
    /// The channel guessed the size; the transfer runs to end of stream.
    Estimated,
    /// The channel did not report a size.
    Unknown,
}

impl SizeSource {
    pub fn is_measured(self) -> bool {
        self == SizeSource::Measured
    }
}

/// One file visible through a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileEntry {
    /// Channel-specific path used to open the file.
    pub path: String,
    /// Path relative to the listing base, `/`-separated.
    pub relative_path: String,
    /// File name (last path component).
    pub name: String,
    /// Size in bytes; see `size_source` before trusting it.
    pub size: u64,
    pub modified_time: Option<SystemTime>,
    /// Whether the file matches the configured target types.
    pub is_target_type: bool,
    pub size_source: SizeSource,
}

impl RemoteFileEntry {
    /// Builds an entry with a measured size, deriving `name` from `relative_path`.
    pub fn new(path: impl Into<String>, relative_path: impl Into<String>, size: u64) -> Self {
        let relative_path = relative_path.into();
        let name = relative_path
            .rsplit('/')
            .next()
            .unwrap_or(relative_path.as_str())
            .to_string();
        Self {
            path: path.into(),
            relative_path,
            name,
            size,
            modified_time: None,
            is_target_type: true,
            size_source: SizeSource::Measured,
        }
    }

    pub fn with_size_source(mut self, source: SizeSource) -> Self {
        self.size_source = source;
        self
    }

    pub fn with_modified(mut self, modified: SystemTime) -> Self {
        self.modified_time = Some(modified);
        self
    }

    /// Lowercase extension of `name`, if any.
    pub fn extension(&self) -> Option<String> {
        let (stem, ext) = self.name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }

    /// Size to use as transfer total, if it can be trusted.
    pub fn measured_size(&self) -> Option<u64> {
        self.size_source.is_measured().then_some(self.size)
    }
}

/// Outcome of one file transfer.
#[derive(Debug)]
pub struct TransferResult {
    pub file: RemoteFileEntry,
    pub success: bool,
    /// Bytes copied during this run (excludes bytes restored from a checkpoint).
    pub bytes_copied: u64,
    /// Offset the run resumed from (0 for fresh transfers).
    pub resumed_from: u64,
    pub duration: Duration,
    pub target_path: PathBuf,
    pub skipped: bool,
    pub skip_reason: Option<String>,
    /// Verified digest of the finalized file.
    pub digest: Option<String>,
    pub error: Option<BridgeError>,
}

impl TransferResult {
    pub fn skipped(file: RemoteFileEntry, target_path: PathBuf, reason: impl Into<String>) -> Self {
        Self {
            file,
            success: true,
            bytes_copied: 0,
            resumed_from: 0,
            duration: Duration::ZERO,
            target_path,
            skipped: true,
            skip_reason: Some(reason.into()),
            digest: None,
            error: None,
        }
    }

    pub fn failed(file: RemoteFileEntry, target_path: PathBuf, error: BridgeError) -> Self {
        Self {
            file,
            success: false,
            bytes_copied: 0,
            resumed_from: 0,
            duration: Duration::ZERO,
            target_path,
            skipped: false,
            skip_reason: None,
            digest: None,
            error: Some(error),
        }
    }
}
