//! Device enumeration.
//!
//! Devices come from the host (Linux sysfs USB tree) and from the
//! configuration file. [`CompositeEnumerator`] merges several sources and
//! drops duplicates.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use access::{DeviceDescriptor, Result};

use crate::config::DeviceConfig;

/// Default sysfs directory listing USB devices.
const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";

/// A source of attached devices.
pub trait DeviceEnumerator: Send + Sync {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;
}

/// Reads USB devices from sysfs.
///
/// Hosts without sysfs report no devices rather than an error.
pub struct SysfsEnumerator {
    root: PathBuf,
}

impl Default for SysfsEnumerator {
    fn default() -> Self {
        Self::with_root(SYSFS_USB_DEVICES)
    }
}

impl SysfsEnumerator {
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl DeviceEnumerator for SysfsEnumerator {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No sysfs USB tree at {:?}", self.root);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut devices = Vec::new();
        for entry in entries.flatten() {
            let dir = entry.path();
            // Interface nodes ("1-2:1.0") carry no device identity.
            if entry.file_name().to_string_lossy().contains(':') {
                continue;
            }
            let (Some(vendor_id), Some(product_id)) = (
                read_trimmed(&dir.join("idVendor")),
                read_trimmed(&dir.join("idProduct")),
            ) else {
                continue;
            };

            let display_name = read_trimmed(&dir.join("product"))
                .or_else(|| read_trimmed(&dir.join("manufacturer")))
                .unwrap_or_else(|| format!("USB {vendor_id}:{product_id}"));

            devices.push(
                DeviceDescriptor::new(
                    display_name,
                    vendor_id.to_ascii_lowercase(),
                    product_id.to_ascii_lowercase(),
                )
                .with_handle(dir.to_string_lossy()),
            );
        }

        devices.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        Ok(devices)
    }
}

/// Devices declared in the configuration file.
pub struct StaticEnumerator {
    devices: Vec<DeviceDescriptor>,
}

impl StaticEnumerator {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        Self { devices }
    }

    pub fn from_config(devices: &[DeviceConfig]) -> Self {
        Self::new(
            devices
                .iter()
                .filter(|d| !d.name.is_empty())
                .map(|d| {
                    DeviceDescriptor::new(
                        d.name.clone(),
                        d.vendor_id.to_ascii_lowercase(),
                        d.product_id.to_ascii_lowercase(),
                    )
                    .with_handle(d.handle.clone())
                })
                .collect(),
        )
    }
}

impl DeviceEnumerator for StaticEnumerator {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self.devices.clone())
    }
}

/// Merges several enumerators, earlier sources winning on duplicates.
pub struct CompositeEnumerator {
    sources: Vec<Box<dyn DeviceEnumerator>>,
}

impl CompositeEnumerator {
    pub fn new(sources: Vec<Box<dyn DeviceEnumerator>>) -> Self {
        Self { sources }
    }
}

impl DeviceEnumerator for CompositeEnumerator {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut seen = HashSet::new();
        let mut devices = Vec::new();
        for source in &self.sources {
            match source.enumerate() {
                Ok(found) => {
                    for device in found {
                        let key = (
                            device.display_name.to_lowercase(),
                            device.vendor_id.clone(),
                            device.product_id.clone(),
                        );
                        if seen.insert(key) {
                            devices.push(device);
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Device enumeration source failed"),
            }
        }
        Ok(devices)
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
