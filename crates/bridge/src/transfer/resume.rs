//! Persistent checkpoints for in-flight transfers.
//!
//! Each partially copied file has one JSON record in the resume directory,
//! named after a SHA-256 of the source path, and one temp file next to its
//! final target. The record says how many bytes of the temp file are known
//! good. Records are created by the first checkpoint, updated on every later
//! checkpoint, and removed on finalize, on abandonment, or by the expiry sweep.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use access::{BridgeError, RemoteFileEntry, Result, SizeSource};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Checkpoint of one in-flight transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    /// Channel path of the source file.
    pub source_path: String,
    /// Partial file next to the target.
    pub temp_path: PathBuf,
    /// Final destination.
    pub target_path: PathBuf,
    /// Bytes of `temp_path` known to be good.
    pub copied_bytes: u64,
    /// Expected total; only authoritative when `size_source` is measured.
    pub total_bytes: u64,
    pub size_source: SizeSource,
    pub chunk_size: u64,
    pub last_updated: SystemTime,
    /// Free-form data, e.g. the running digest at the final checkpoint.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ResumeState {
    /// Whether every expected byte is already in the temp file.
    pub fn is_complete(&self) -> bool {
        self.size_source.is_measured() && self.copied_bytes >= self.total_bytes
    }

    /// Time since the last checkpoint. Clock skew counts as zero.
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.last_updated)
            .unwrap_or(Duration::ZERO)
    }
}

/// On-disk record wrapper.
#[derive(Debug, Serialize, Deserialize)]
struct ResumeRecord {
    /// Version of the record format (for future migrations).
    version: u32,
    state: ResumeState,
}

const RECORD_VERSION: u32 = 1;

/// Tracks resume records and their temp files.
///
/// All store access goes through one mutex so that a checkpoint and the
/// matching cache update are observed together.
pub struct ResumeManager {
    dir: PathBuf,
    cache: Mutex<HashMap<String, ResumeState>>,
}

impl ResumeManager {
    /// Opens (creating if needed) the resume directory.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| BridgeError::from(e).with_context("resume_dir", dir.display()))?;
        tracing::debug!("Resume records stored in {:?}", dir);
        Ok(Self {
            dir,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stable key for a source path (hex SHA-256).
    pub fn key_for(source_path: &str) -> String {
        hex::encode(Sha256::digest(source_path.as_bytes()))
    }

    /// Deterministic temp path next to `target`, on the same filesystem.
    pub fn temp_path_for(source_path: &str, target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "transfer".to_string());
        let key = Self::key_for(source_path);
        let temp_name = format!(".{}.{}.part", name, &key[..16]);
        match target.parent() {
            Some(parent) => parent.join(temp_name),
            None => PathBuf::from(temp_name),
        }
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, ResumeState>>> {
        self.cache
            .lock()
            .map_err(|_| BridgeError::transport("resume store lock poisoned"))
    }

    /// Builds a fresh, not yet persisted state for `entry`.
    pub fn begin(&self, entry: &RemoteFileEntry, target: &Path, chunk_size: u64) -> ResumeState {
        ResumeState {
            source_path: entry.path.clone(),
            temp_path: Self::temp_path_for(&entry.path, target),
            target_path: target.to_path_buf(),
            copied_bytes: 0,
            total_bytes: entry.size,
            size_source: entry.size_source,
            chunk_size,
            last_updated: SystemTime::now(),
            metadata: BTreeMap::new(),
        }
    }

    /// Returns the persisted state for `source_path`, if any.
    ///
    /// Unreadable records are discarded and reported as absent.
    pub fn get(&self, source_path: &str) -> Result<Option<ResumeState>> {
        let key = Self::key_for(source_path);
        let mut cache = self.lock()?;
        if let Some(state) = cache.get(&key) {
            return Ok(Some(state.clone()));
        }

        let path = self.record_path(&key);
        let state = match read_record(&path) {
            Ok(Some(state)) => state,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!(
                    record = %path.display(),
                    error = %e,
                    "Discarding unreadable resume record"
                );
                let _ = fs::remove_file(&path);
                return Ok(None);
            }
        };

        if state.source_path != source_path {
            tracing::warn!(
                record = %path.display(),
                "Resume record belongs to another source, ignoring"
            );
            return Ok(None);
        }

        cache.insert(key, state.clone());
        Ok(Some(state))
    }

    /// Persists `state` as the latest checkpoint for its source.
    ///
    /// Refuses to move `copied_bytes` backwards relative to the persisted
    /// record; use [`clear`](Self::clear) to restart a transfer.
    pub fn checkpoint(&self, state: &mut ResumeState) -> Result<()> {
        let key = Self::key_for(&state.source_path);
        let mut cache = self.lock()?;

        let previous = match cache.get(&key) {
            Some(prev) => Some(prev.copied_bytes),
            None => read_record(&self.record_path(&key))
                .ok()
                .flatten()
                .map(|s| s.copied_bytes),
        };
        if let Some(previous) = previous {
            if state.copied_bytes < previous {
                return Err(BridgeError::invalid_parameter(format!(
                    "checkpoint would move backwards from {} to {} bytes",
                    previous, state.copied_bytes
                ))
                .with_context("source_path", &state.source_path));
            }
        }

        state.last_updated = SystemTime::now();
        self.write_record(&key, state)?;
        cache.insert(key, state.clone());

        tracing::debug!(
            source = %state.source_path,
            copied = state.copied_bytes,
            total = state.total_bytes,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Moves the temp file onto the target and deletes the record.
    pub fn finalize(&self, state: &ResumeState) -> Result<()> {
        let key = Self::key_for(&state.source_path);
        let mut cache = self.lock()?;

        fs::rename(&state.temp_path, &state.target_path).map_err(|e| {
            BridgeError::from(e)
                .with_context("temp_path", state.temp_path.display())
                .with_context("target_path", state.target_path.display())
        })?;

        remove_if_exists(&self.record_path(&key))?;
        cache.remove(&key);

        tracing::debug!(target = %state.target_path.display(), "Transfer finalized");
        Ok(())
    }

    /// Abandons the transfer of `source_path`: deletes its temp file and record.
    pub fn clear(&self, source_path: &str) -> Result<()> {
        let key = Self::key_for(source_path);
        let mut cache = self.lock()?;

        let record_path = self.record_path(&key);
        let state = cache
            .remove(&key)
            .or_else(|| read_record(&record_path).ok().flatten());
        if let Some(state) = state {
            remove_if_exists(&state.temp_path)?;
        }
        remove_if_exists(&record_path)?;

        tracing::debug!(source = source_path, "Resume state cleared");
        Ok(())
    }

    /// Every persisted record, oldest first.
    pub fn list(&self) -> Result<Vec<ResumeState>> {
        let _cache = self.lock()?;
        let mut states: Vec<ResumeState> = self
            .record_files()?
            .iter()
            .filter_map(|path| read_record(path).ok().flatten())
            .collect();
        states.sort_by_key(|s| s.last_updated);
        Ok(states)
    }

    /// Removes records (and their temp files) not updated within `max_age`.
    ///
    /// Unreadable records are removed as well. Returns how many were removed.
    pub fn cleanup_expired(&self, max_age: Duration) -> Result<usize> {
        let mut cache = self.lock()?;
        let mut removed = 0;

        for path in self.record_files()? {
            match read_record(&path) {
                Ok(Some(state)) => {
                    if state.age() <= max_age {
                        continue;
                    }
                    remove_if_exists(&state.temp_path)?;
                    remove_if_exists(&path)?;
                    cache.remove(&Self::key_for(&state.source_path));
                    removed += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        record = %path.display(),
                        error = %e,
                        "Removing unreadable resume record"
                    );
                    remove_if_exists(&path)?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::info!("Removed {} expired resume records", removed);
        }
        Ok(removed)
    }

    fn record_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        Ok(files)
    }

    fn write_record(&self, key: &str, state: &ResumeState) -> Result<()> {
        let record = ResumeRecord {
            version: RECORD_VERSION,
            state: state.clone(),
        };
        let contents = serde_json::to_vec_pretty(&record)?;

        let path = self.record_path(key);
        write_atomic(&path, &contents)
            .map_err(|e| BridgeError::from(e).with_context("record", path.display()))
    }
}

/// Writes `contents` to `<path>.tmp`, syncs it and renames it over `path`.
///
/// Readers see either the old file or the complete new one, including after
/// a power loss.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let temp_path = path.with_extension("json.tmp");
    let mut file = File::create(&temp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp_path, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn read_record(path: &Path) -> Result<Option<ResumeState>> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let record: ResumeRecord = serde_json::from_slice(&contents)?;
    if record.version != RECORD_VERSION {
        return Err(BridgeError::invalid_parameter(format!(
            "unsupported resume record version {}",
            record.version
        )));
    }
    Ok(Some(record.state))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BridgeError::from(e).with_context("path", path.display())),
    }
}
