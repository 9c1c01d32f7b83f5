//! Direct filesystem access through a mount point.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use access::{
    AccessChannel, AccessMethod, BridgeError, DeviceDescriptor, RemoteFileEntry, RemoteStream,
    Result,
};

use crate::transfer::validate_relative_path;

/// Channel reading the device through a mounted directory.
pub struct DirectFilesystemChannel {
    device: DeviceDescriptor,
    root: PathBuf,
    connected: AtomicBool,
}

impl DirectFilesystemChannel {
    pub fn new(device: DeviceDescriptor, root: impl Into<PathBuf>) -> Self {
        Self {
            device,
            root: root.into(),
            connected: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BridgeError::transport("filesystem channel is not connected")
                .with_context("root", self.root.display()))
        }
    }

    fn walk(&self, dir: &Path, base: &Path, out: &mut Vec<RemoteFileEntry>) -> Result<()> {
        let entries = fs::read_dir(dir)
            .map_err(|e| BridgeError::from(e).with_context("dir", dir.display()))?;

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            // Symlinks are not followed so a listing cannot leave the mount.
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::debug!(
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable entry"
                    );
                    continue;
                }
            };

            if meta.is_dir() {
                if let Err(e) = self.walk(&path, base, out) {
                    tracing::warn!(
                        dir = %path.display(),
                        error = %e,
                        "Skipping unreadable directory"
                    );
                }
            } else if meta.is_file() {
                let Ok(relative) = path.strip_prefix(base) else {
                    continue;
                };
                let relative = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let mut file = RemoteFileEntry::new(path.to_string_lossy(), relative, meta.len());
                if let Ok(modified) = meta.modified() {
                    file = file.with_modified(modified);
                }
                out.push(file);
            }
        }
        Ok(())
    }
}

impl AccessChannel for DirectFilesystemChannel {
    fn method(&self) -> AccessMethod {
        AccessMethod::DirectFilesystem
    }

    fn connect_to_device(&self, name: &str, _vendor_id: &str, _product_id: &str) -> Result<()> {
        let meta = fs::metadata(&self.root).map_err(|e| {
            let err = match e.kind() {
                std::io::ErrorKind::NotFound => {
                    BridgeError::device_not_found(format!("mount point for {name} is gone"))
                        .with_source(e)
                }
                _ => BridgeError::from(e),
            };
            err.with_context("root", self.root.display())
        })?;
        if !meta.is_dir() {
            return Err(BridgeError::device_not_found(format!(
                "mount point for {name} is not a directory"
            ))
            .with_context("root", self.root.display()));
        }
        // Mounted but unreadable counts as a failed connect.
        fs::read_dir(&self.root)
            .map_err(|e| BridgeError::from(e).with_context("root", self.root.display()))?;

        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!(root = %self.root.display(), "Filesystem channel connected");
        Ok(())
    }

    fn list_files(&self, base_path: &str) -> Result<Vec<RemoteFileEntry>> {
        self.ensure_connected()?;
        let base = if base_path.is_empty() || base_path == "/" {
            self.root.clone()
        } else {
            self.root
                .join(validate_relative_path(base_path.trim_start_matches('/'))?)
        };

        let mut entries = Vec::new();
        self.walk(&base, &base, &mut entries)?;
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(entries)
    }

    fn get_file_stream(&self, path: &str) -> Result<Box<dyn RemoteStream>> {
        self.ensure_connected()?;
        let path = Path::new(path);
        let escapes = path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
        if escapes || !path.starts_with(&self.root) {
            return Err(BridgeError::invalid_parameter(format!(
                "{} is outside the device root",
                path.display()
            )));
        }
        let file = File::open(path)
            .map_err(|e| BridgeError::from(e).with_context("path", path.display()))?;
        Ok(Box::new(file))
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

#[cfg(test)]
mod tests {
    use super::*;
    use access::ErrorCode;
    use std::io::Read;
    use tempfile::TempDir;

    fn mounted() -> (TempDir, DirectFilesystemChannel) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("DCIM/100APPLE")).unwrap();
        fs::write(dir.path().join("DCIM/100APPLE/IMG_0001.JPG"), b"jpegdata").unwrap();
        fs::write(dir.path().join("DCIM/100APPLE/IMG_0002.MOV"), b"movdata!!").unwrap();
        fs::write(dir.path().join("notes.txt"), b"n").unwrap();
        let channel = DirectFilesystemChannel::new(
            DeviceDescriptor::new("Camera", "04a9", "3218"),
            dir.path(),
        );
        (dir, channel)
    }

    #[test]
    fn test_requires_connect() {
        let (_dir, channel) = mounted();
        assert!(!channel.is_connected());
        assert!(channel.list_files("").is_err());
    }

    #[test]
    fn test_connect_missing_root() {
        let channel = DirectFilesystemChannel::new(
            DeviceDescriptor::new("Camera", "", ""),
            "/nonexistent/devbridge/mount",
        );
        let err = channel.connect_to_device("Camera", "", "").unwrap_err();
        assert!(err.is(ErrorCode::DeviceNotFound));
        assert!(!channel.is_connected());
    }

    #[test]
    fn test_recursive_listing() {
        let (_dir, channel) = mounted();
        channel.connect_to_device("Camera", "04a9", "3218").unwrap();

        let entries = channel.list_files("").unwrap();
        let relative: Vec<&str> = entries.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(
            relative,
            vec!["DCIM/100APPLE/IMG_0001.JPG", "DCIM/100APPLE/IMG_0002.MOV", "notes.txt"]
        );
        assert_eq!(entries[1].size, 9);
        assert_eq!(entries[1].name, "IMG_0002.MOV");
        assert!(entries[0].modified_time.is_some());
    }

    #[test]
    fn test_listing_under_base_path() {
        let (_dir, channel) = mounted();
        channel.connect_to_device("Camera", "", "").unwrap();

        let entries = channel.list_files("DCIM").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].relative_path, "100APPLE/IMG_0001.JPG");

        assert!(channel.list_files("../etc").is_err());
    }

    #[test]
    fn test_stream_is_seekable() {
        let (_dir, channel) = mounted();
        channel.connect_to_device("Camera", "", "").unwrap();
        let entries = channel.list_files("").unwrap();

        let mut stream = channel.get_file_stream(&entries[0].path).unwrap();
        assert!(stream.try_seek(4).unwrap());
        let mut rest = String::new();
        stream.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "data");
    }

    #[test]
    fn test_stream_outside_root_rejected() {
        let (_dir, channel) = mounted();
        channel.connect_to_device("Camera", "", "").unwrap();
        let err = channel.get_file_stream("/etc/passwd").err().unwrap();
        assert!(err.is(ErrorCode::InvalidParameter));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (_dir, channel) = mounted();
        channel.connect_to_device("Camera", "", "").unwrap();
        channel.close().unwrap();
        channel.close().unwrap();
        assert!(!channel.is_connected());
    }
}
