//! Scripted channels and resolvers shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bridge::access::{
    AccessChannel, AccessMethod, BridgeError, DeviceDescriptor, ErrorCode, PathResolver,
    RemoteFileEntry, RemoteStream, Result,
};
use bridge::devices::StaticEnumerator;
use bridge::{ChannelFactory, DeviceBridge, RetryManager, RetryPolicy};
use tokio_util::sync::CancellationToken;

/// Deterministic, non-repeating-looking test content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

#[derive(Default)]
struct ChannelState {
    files: HashMap<String, Arc<Vec<u8>>>,
    fail_at: HashMap<String, u64>,
    cancel_at: HashMap<String, (u64, CancellationToken)>,
    list_error: Option<ErrorCode>,
}

/// In-memory channel whose failures are scripted per test.
pub struct ScriptedChannel {
    method: AccessMethod,
    state: Mutex<ChannelState>,
    connected: AtomicBool,
    list_calls: AtomicUsize,
    opens: AtomicUsize,
    first_reads: Arc<Mutex<Vec<u64>>>,
}

impl ScriptedChannel {
    pub fn new(method: AccessMethod) -> Arc<Self> {
        Arc::new(Self {
            method,
            state: Mutex::new(ChannelState::default()),
            connected: AtomicBool::new(false),
            list_calls: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            first_reads: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Adds a file reachable at `/<relative>`.
    pub fn add_file(&self, relative: &str, data: Vec<u8>) -> RemoteFileEntry {
        let path = format!("/{relative}");
        let entry = RemoteFileEntry::new(path.clone(), relative, data.len() as u64);
        self.state.lock().unwrap().files.insert(path, Arc::new(data));
        entry
    }

    /// Every stream of `path` fails once it reaches `offset`.
    pub fn fail_at(&self, path: &str, offset: u64) {
        self.state.lock().unwrap().fail_at.insert(path.to_string(), offset);
    }

    /// Streams of `path` cancel `token` once they have served `offset` bytes.
    pub fn cancel_at(&self, path: &str, offset: u64, token: CancellationToken) {
        self.state
            .lock()
            .unwrap()
            .cancel_at
            .insert(path.to_string(), (offset, token));
    }

    pub fn heal(&self, path: &str) {
        self.state.lock().unwrap().fail_at.remove(path);
    }

    pub fn fail_listing(&self, code: ErrorCode) {
        self.state.lock().unwrap().list_error = Some(code);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Offset of the first read of every stream opened so far.
    pub fn first_reads(&self) -> Vec<u64> {
        self.first_reads.lock().unwrap().clone()
    }
}

impl AccessChannel for ScriptedChannel {
    fn method(&self) -> AccessMethod {
        self.method
    }

    fn connect_to_device(&self, _name: &str, _vendor_id: &str, _product_id: &str) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn list_files(&self, _base_path: &str) -> Result<Vec<RemoteFileEntry>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        if let Some(code) = state.list_error {
            return Err(BridgeError::new(code, format!("{} listing failed", self.method)));
        }
        let mut entries: Vec<RemoteFileEntry> = state
            .files
            .iter()
            .map(|(path, data)| {
                RemoteFileEntry::new(path.clone(), path.trim_start_matches('/'), data.len() as u64)
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn get_file_stream(&self, path: &str) -> Result<Box<dyn RemoteStream>> {
        let state = self.state.lock().unwrap();
        let data = state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| BridgeError::invalid_parameter(format!("no such file: {path}")))?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedStream {
            data,
            pos: 0,
            fail_at: state.fail_at.get(path).copied(),
            cancel_at: state.cancel_at.get(path).cloned(),
            first_read: true,
            first_reads: self.first_reads.clone(),
        }))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn device_info(&self) -> DeviceDescriptor {
        DeviceDescriptor::new("Camera", "04a9", "3218")
    }

    fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct ScriptedStream {
    data: Arc<Vec<u8>>,
    pos: u64,
    fail_at: Option<u64>,
    cancel_at: Option<(u64, CancellationToken)>,
    first_read: bool,
    first_reads: Arc<Mutex<Vec<u64>>>,
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.first_read {
            self.first_read = false;
            self.first_reads.lock().unwrap().push(self.pos);
        }
        let mut end = self.data.len() as u64;
        if let Some(fail_at) = self.fail_at {
            if self.pos >= fail_at {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device went away"));
            }
            end = end.min(fail_at);
        }
        let n = (end.saturating_sub(self.pos) as usize).min(buf.len());
        if n == 0 {
            return Ok(0);
        }
        let start = self.pos as usize;
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        if let Some((offset, ref token)) = self.cancel_at {
            if self.pos >= offset {
                token.cancel();
            }
        }
        Ok(n)
    }
}

impl RemoteStream for ScriptedStream {
    fn try_seek(&mut self, offset: u64) -> io::Result<bool> {
        self.pos = offset;
        Ok(true)
    }
}

/// Resolver that always returns the same address.
pub struct FixedResolver {
    pub method: AccessMethod,
    pub priority: i32,
    pub address: String,
}

impl PathResolver for FixedResolver {
    fn method(&self) -> AccessMethod {
        self.method
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn is_available(&self) -> bool {
        true
    }

    fn resolve(&self, _device: &DeviceDescriptor) -> Result<String> {
        Ok(self.address.clone())
    }
}

/// Hands out pre-built channels by method.
pub struct ScriptedFactory {
    pub channels: HashMap<AccessMethod, Arc<ScriptedChannel>>,
}

impl ChannelFactory for ScriptedFactory {
    fn create(
        &self,
        method: AccessMethod,
        _device: &DeviceDescriptor,
        _address: &str,
    ) -> Result<Arc<dyn AccessChannel>> {
        let channel = self
            .channels
            .get(&method)
            .cloned()
            .ok_or_else(|| BridgeError::not_supported(format!("{method} not scripted")))?;
        Ok(channel)
    }
}

/// A bridge over one "Camera" device where each `(method, priority)` has a
/// scripted channel.
pub fn scripted_bridge(
    methods: &[(AccessMethod, i32)],
    retry: Arc<RetryManager>,
) -> (DeviceBridge, HashMap<AccessMethod, Arc<ScriptedChannel>>) {
    let mut channels = HashMap::new();
    let mut resolvers: Vec<Box<dyn PathResolver>> = Vec::new();
    for &(method, priority) in methods {
        channels.insert(method, ScriptedChannel::new(method));
        resolvers.push(Box::new(FixedResolver {
            method,
            priority,
            address: format!("{method}://camera"),
        }));
    }

    let bridge = DeviceBridge::new(
        Box::new(StaticEnumerator::new(vec![DeviceDescriptor::new(
            "Camera", "04a9", "3218",
        )])),
        resolvers,
        Box::new(ScriptedFactory {
            channels: channels.clone(),
        }),
        retry,
    );
    (bridge, channels)
}

pub fn retry_manager() -> Arc<RetryManager> {
    Arc::new(RetryManager::new(RetryPolicy::default()))
}
