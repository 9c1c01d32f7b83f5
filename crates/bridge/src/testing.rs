//! In-memory channel used by unit tests.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use access::{
    AccessChannel, AccessMethod, BridgeError, DeviceDescriptor, RemoteFileEntry, RemoteStream,
    Result,
};

/// How streams for one file behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamBehavior {
    Normal,
    /// Serves bytes up to the offset, then every read fails.
    FailAt(u64),
    /// Cannot seek; resumes must read and discard.
    Unseekable,
}

struct MemoryFile {
    entry: RemoteFileEntry,
    data: Arc<Vec<u8>>,
    behavior: StreamBehavior,
    opens: usize,
    seeks: Arc<Mutex<Vec<u64>>>,
}

pub struct MemoryChannel {
    method: AccessMethod,
    files: Mutex<Vec<MemoryFile>>,
    connected: AtomicBool,
    fail_connect: Mutex<Option<BridgeError>>,
}

impl MemoryChannel {
    pub fn new(method: AccessMethod) -> Self {
        Self {
            method,
            files: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            fail_connect: Mutex::new(None),
        }
    }

    /// Adds a file at `/<relative>` and returns its entry.
    pub fn add_file(&self, relative: &str, data: Vec<u8>) -> RemoteFileEntry {
        let entry = RemoteFileEntry::new(format!("/{relative}"), relative, data.len() as u64);
        self.files.lock().unwrap().push(MemoryFile {
            entry: entry.clone(),
            data: Arc::new(data),
            behavior: StreamBehavior::Normal,
            opens: 0,
            seeks: Arc::new(Mutex::new(Vec::new())),
        });
        entry
    }

    pub fn set_behavior(&self, path: &str, behavior: StreamBehavior) {
        let mut files = self.files.lock().unwrap();
        let file = files.iter_mut().find(|f| f.entry.path == path).unwrap();
        file.behavior = behavior;
        file.seeks.lock().unwrap().clear();
    }

    pub fn fail_connect(&self, error: Option<BridgeError>) {
        *self.fail_connect.lock().unwrap() = error;
    }

    pub fn open_count(&self, path: &str) -> usize {
        let files = self.files.lock().unwrap();
        files.iter().find(|f| f.entry.path == path).map_or(0, |f| f.opens)
    }

    pub fn seek_offsets(&self, path: &str) -> Vec<u64> {
        let files = self.files.lock().unwrap();
        files
            .iter()
            .find(|f| f.entry.path == path)
            .map(|f| f.seeks.lock().unwrap().clone())
            .unwrap_or_default()
    }
}

impl AccessChannel for MemoryChannel {
    fn method(&self) -> AccessMethod {
        self.method
    }

    fn connect_to_device(&self, _name: &str, _vendor_id: &str, _product_id: &str) -> Result<()> {
        if let Some(ref err) = *self.fail_connect.lock().unwrap() {
            return Err(BridgeError::new(err.code(), err.message()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn list_files(&self, base_path: &str) -> Result<Vec<RemoteFileEntry>> {
        let files = self.files.lock().unwrap();
        Ok(files
            .iter()
            .filter(|f| f.entry.relative_path.starts_with(base_path))
            .map(|f| f.entry.clone())
            .collect())
    }

    fn get_file_stream(&self, path: &str) -> Result<Box<dyn RemoteStream>> {
        let mut files = self.files.lock().unwrap();
        let file = files
            .iter_mut()
            .find(|f| f.entry.path == path)
            .ok_or_else(|| BridgeError::invalid_parameter(format!("no such file: {path}")))?;
        file.opens += 1;
        Ok(Box::new(MemoryStream {
            data: file.data.clone(),
            pos: 0,
            behavior: file.behavior,
            seeks: file.seeks.clone(),
        }))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn device_info(&self) -> DeviceDescriptor {
        DeviceDescriptor::new("Memory Device", "0000", "0000")
    }

    fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryStream {
    data: Arc<Vec<u8>>,
    pos: u64,
    behavior: StreamBehavior,
    seeks: Arc<Mutex<Vec<u64>>>,
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut end = self.data.len() as u64;
        if let StreamBehavior::FailAt(fail_at) = self.behavior {
            if self.pos >= fail_at {
                return Err(io::Error::other("simulated device disconnect"));
            }
            end = end.min(fail_at);
        }
        let available = end.saturating_sub(self.pos) as usize;
        let n = available.min(buf.len());
        if n == 0 {
            return Ok(0);
        }
        let start = self.pos as usize;
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl RemoteStream for MemoryStream {
    fn try_seek(&mut self, offset: u64) -> io::Result<bool> {
        if self.behavior == StreamBehavior::Unseekable {
            return Ok(false);
        }
        self.seeks.lock().unwrap().push(offset);
        self.pos = offset;
        Ok(true)
    }
}
