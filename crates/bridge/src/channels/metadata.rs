//! Device-management metadata queries.
//!
//! The query command prints JSON, either an array of records or an object
//! with a `files` array:
//!
//! ```json
//! {"files": [{"path": "DCIM/IMG_0001.JPG", "size": 2048, "modified": 1700000000},
//!            {"path": "DCIM/IMG_0002.MOV", "size": 90000, "size_estimated": true}]}
//! ```
//!
//! Metadata services often report sizes from catalog data rather than the
//! file itself, so `size_estimated` is honored and a missing size is unknown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, UNIX_EPOCH};

use access::{
    AccessChannel, AccessMethod, BridgeError, DeviceDescriptor, RemoteFileEntry, RemoteStream,
    Result, SizeSource,
};
use serde::Deserialize;

use super::command::{self, TemplateVars};
use crate::config::MetadataChannelConfig;
use crate::transfer::validate_relative_path;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Listing {
    Records(Vec<MetadataRecord>),
    Wrapped { files: Vec<MetadataRecord> },
}

#[derive(Debug, Deserialize)]
struct MetadataRecord {
    path: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    modified: Option<u64>,
    #[serde(default)]
    size_estimated: bool,
}

pub struct MetadataQueryChannel {
    device: DeviceDescriptor,
    handle: String,
    config: MetadataChannelConfig,
    connected: AtomicBool,
}

impl MetadataQueryChannel {
    pub fn new(
        device: DeviceDescriptor,
        handle: impl Into<String>,
        config: MetadataChannelConfig,
    ) -> Self {
        Self {
            device,
            handle: handle.into(),
            config,
            connected: AtomicBool::new(false),
        }
    }

    fn query(&self, base_path: &str) -> Result<Vec<RemoteFileEntry>> {
        let args = command::render_args(
            &self.config.query_args,
            &TemplateVars {
                device: &self.device,
                handle: &self.handle,
                path: base_path,
            },
        );
        let output = command::run_capture(
            &self.config.program,
            &args,
            Duration::from_secs(self.config.timeout_secs),
        )?;
        parse_listing(&output, base_path)
    }
}

impl AccessChannel for MetadataQueryChannel {
    fn method(&self) -> AccessMethod {
        AccessMethod::MetadataQuery
    }

    fn connect_to_device(&self, name: &str, _vendor_id: &str, _product_id: &str) -> Result<()> {
        if !command::is_program_available(&self.config.program) {
            return Err(BridgeError::not_supported("metadata query program is not available"));
        }
        if self.config.query_args.is_empty() {
            return Err(BridgeError::not_supported("no metadata query configured"));
        }
        // A handle the service does not know fails here rather than at list time.
        self.query("")
            .map_err(|e| e.with_context("device", name).with_context("handle", &self.handle))?;

        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!(handle = %self.handle, "Metadata channel connected");
        Ok(())
    }

    fn list_files(&self, base_path: &str) -> Result<Vec<RemoteFileEntry>> {
        if !self.is_connected() {
            return Err(BridgeError::transport("metadata channel is not connected"));
        }
        self.query(base_path)
    }

    fn get_file_stream(&self, path: &str) -> Result<Box<dyn RemoteStream>> {
        if !self.is_connected() {
            return Err(BridgeError::transport("metadata channel is not connected"));
        }
        if self.config.fetch_args.is_empty() {
            return Err(BridgeError::not_supported("no metadata fetch command configured"));
        }
        let args = command::render_args(
            &self.config.fetch_args,
            &TemplateVars {
                device: &self.device,
                handle: &self.handle,
                path,
            },
        );
        Ok(Box::new(command::spawn_stream(
            &self.config.program,
            &args,
            Duration::from_secs(self.config.timeout_secs),
        )?))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn device_info(&self) -> DeviceDescriptor {
        self.device.clone()
    }

    fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Parses query output into entries relative to `base_path`.
pub fn parse_listing(output: &str, base_path: &str) -> Result<Vec<RemoteFileEntry>> {
    let listing: Listing = serde_json::from_str(output.trim())?;
    let records = match listing {
        Listing::Records(records) | Listing::Wrapped { files: records } => records,
    };

    let base = base_path.trim_matches('/');
    let mut entries = Vec::with_capacity(records.len());
    for record in records {
        let trimmed = record.path.trim_start_matches('/');
        let relative = if base.is_empty() {
            trimmed
        } else {
            match trimmed.strip_prefix(base) {
                Some(rest) if rest.starts_with('/') => &rest[1..],
                _ => trimmed,
            }
        };
        if let Err(e) = validate_relative_path(relative) {
            tracing::warn!(path = %record.path, error = %e, "Skipping metadata record");
            continue;
        }

        let source = match (record.size, record.size_estimated) {
            (None, _) => SizeSource::Unknown,
            (Some(_), true) => SizeSource::Estimated,
            (Some(_), false) => SizeSource::Measured,
        };
        let mut entry =
            RemoteFileEntry::new(record.path.clone(), relative, record.size.unwrap_or(0))
                .with_size_source(source);
        if let Some(secs) = record.modified {
            entry = entry.with_modified(UNIX_EPOCH + Duration::from_secs(secs));
        }
        entries.push(entry);
    }
    Ok(entries)
}
