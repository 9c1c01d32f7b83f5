//! Contracts implemented by access channels and path resolvers.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::error::Result;
use crate::types::{AccessMethod, DeviceDescriptor, RemoteFileEntry};

/// A readable byte stream for one remote file.
///
/// Channels whose underlying mechanism can seek override [`try_seek`]; the
/// default reports that seeking is unsupported and callers fall back to
/// reading and discarding.
///
/// [`try_seek`]: RemoteStream::try_seek
pub trait RemoteStream: Read + Send {
    /// Positions the stream at `offset` bytes from the start.
    ///
    /// Returns `Ok(false)` if the stream cannot seek.
    fn try_seek(&mut self, _offset: u64) -> std::io::Result<bool> {
        Ok(false)
    }
}

impl RemoteStream for File {
    fn try_seek(&mut self, offset: u64) -> std::io::Result<bool> {
        self.seek(SeekFrom::Start(offset))?;
        Ok(true)
    }
}

/// A concrete mechanism for connecting to, listing and streaming files from
/// the external device.
///
/// All calls are blocking. Implementations must be safe to share between
/// worker threads; per-file streams are independent of each other.
pub trait AccessChannel: Send + Sync {
    /// Which access method this channel implements.
    fn method(&self) -> AccessMethod;

    /// Establishes access to the device. Must fail fast if the resolved path
    /// or handle is not actually usable.
    fn connect_to_device(&self, name: &str, vendor_id: &str, product_id: &str) -> Result<()>;

    /// Lists files under `base_path` (channel-relative; empty means the root).
    fn list_files(&self, base_path: &str) -> Result<Vec<RemoteFileEntry>>;

    /// Opens a byte stream for the file at `path` (as reported in
    /// [`RemoteFileEntry::path`]).
    fn get_file_stream(&self, path: &str) -> Result<Box<dyn RemoteStream>>;

    /// Returns whether the channel currently has access to the device.
    fn is_connected(&self) -> bool;

    /// Returns the descriptor of the device this channel talks to.
    fn device_info(&self) -> DeviceDescriptor;

    /// Releases the channel. Closing twice is not an error.
    fn close(&self) -> Result<()>;
}

/// A strategy for turning a device's identity into a reachable path or handle.
pub trait PathResolver: Send + Sync {
    /// The access method whose channel consumes this resolver's output.
    fn method(&self) -> AccessMethod;

    /// Static priority; higher values are tried first.
    fn priority(&self) -> i32;

    /// Cheap capability probe, e.g. "is the underlying program installed".
    fn is_available(&self) -> bool;

    /// Resolves the device to a path or handle.
    fn resolve(&self, device: &DeviceDescriptor) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::TempDir;

    struct Unseekable(Cursor<Vec<u8>>);

    impl Read for Unseekable {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl RemoteStream for Unseekable {}

    #[test]
    fn test_default_stream_cannot_seek() {
        let mut stream = Unseekable(Cursor::new(b"abc".to_vec()));
        assert!(!stream.try_seek(1).unwrap());
    }

    #[test]
    fn test_file_stream_seeks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"0123456789")
            .unwrap();

        let mut file = File::open(&path).unwrap();
        assert!(RemoteStream::try_seek(&mut file, 6).unwrap());
        let mut rest = String::new();
        file.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "6789");
    }
}
