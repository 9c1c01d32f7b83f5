//! One file's resumable, verified copy.
//!
//! A session consults the [`ResumeManager`] for an earlier checkpoint, copies
//! the remaining bytes from the channel stream into the temp file in
//! `chunk_size` pieces, checkpoints every `checkpoint_interval` bytes and at
//! the end, renames the temp file onto the target and verifies the result.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use access::{
    AccessChannel, BridgeError, RemoteFileEntry, RemoteStream, Result, SizeSource, TransferResult,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::integrity::{IntegrityVerifier, StreamingDigest};
use super::resume::{ResumeManager, ResumeState};
use super::TransferEvent;

/// Metadata key holding the running digest at the final checkpoint.
const DIGEST_KEY: &str = "digest";
/// Metadata key naming the algorithm of [`DIGEST_KEY`].
const DIGEST_ALGORITHM_KEY: &str = "digest_algorithm";

/// Plain transfer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// Bytes read from the stream per chunk.
    pub chunk_size: u64,
    /// Bytes between two persisted checkpoints.
    pub checkpoint_interval: u64,
    /// Replace files already present at the target.
    pub overwrite: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            checkpoint_interval: 4 * 1024 * 1024,
            overwrite: false,
        }
    }
}

impl TransferOptions {
    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(BridgeError::invalid_parameter("chunk_size must be greater than 0"));
        }
        if self.checkpoint_interval == 0 {
            return Err(BridgeError::invalid_parameter(
                "checkpoint_interval must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Copies files from one channel with checkpointing and verification.
///
/// A session is cheap to clone and can be reused for many files; each call to
/// [`run`](Self::run) is independent.
#[derive(Clone)]
pub struct TransferSession {
    channel: Arc<dyn AccessChannel>,
    resume: Arc<ResumeManager>,
    verifier: IntegrityVerifier,
    options: TransferOptions,
    events: Option<broadcast::Sender<TransferEvent>>,
}

/// What a successful copy produced.
struct Copied {
    bytes_copied: u64,
    resumed_from: u64,
    digest: String,
}

enum Plan {
    Skip(String),
    Copy(ResumeState),
}

impl TransferSession {
    pub fn new(
        channel: Arc<dyn AccessChannel>,
        resume: Arc<ResumeManager>,
        verifier: IntegrityVerifier,
        options: TransferOptions,
    ) -> Self {
        Self {
            channel,
            resume,
            verifier,
            options,
            events: None,
        }
    }

    /// Publishes checkpoint progress on `events`.
    pub fn with_events(mut self, events: broadcast::Sender<TransferEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    /// Copies `entry` to `target`.
    ///
    /// Never panics on transfer failures; the outcome, including any error,
    /// is reported in the returned [`TransferResult`].
    pub fn run(
        &self,
        entry: &RemoteFileEntry,
        target: &Path,
        cancel: &CancellationToken,
    ) -> TransferResult {
        let id = Uuid::new_v4();
        let span = tracing::info_span!("transfer", %id, file = %entry.relative_path);
        let _enter = span.enter();
        let start = Instant::now();

        let outcome = self
            .plan(entry, target, cancel)
            .and_then(|plan| match plan {
                Plan::Skip(reason) => Ok(Err(reason)),
                Plan::Copy(state) => self.copy(entry, state, cancel).map(Ok),
            });

        match outcome {
            Ok(Ok(copied)) => {
                tracing::info!(
                    bytes = copied.bytes_copied,
                    resumed_from = copied.resumed_from,
                    "Transfer complete"
                );
                TransferResult {
                    file: entry.clone(),
                    success: true,
                    bytes_copied: copied.bytes_copied,
                    resumed_from: copied.resumed_from,
                    duration: start.elapsed(),
                    target_path: target.to_path_buf(),
                    skipped: false,
                    skip_reason: None,
                    digest: Some(copied.digest),
                    error: None,
                }
            }
            Ok(Err(reason)) => {
                tracing::info!(reason = %reason, "Transfer skipped");
                TransferResult::skipped(entry.clone(), target.to_path_buf(), reason)
            }
            Err(e) => {
                tracing::warn!(error = %e, retryable = e.is_retryable(), "Transfer failed");
                let mut result = TransferResult::failed(entry.clone(), target.to_path_buf(), e);
                result.duration = start.elapsed();
                result
            }
        }
    }

    /// Decides between skipping, resuming and starting fresh.
    fn plan(
        &self,
        entry: &RemoteFileEntry,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<Plan> {
        self.options.validate()?;
        if cancel.is_cancelled() {
            return Err(BridgeError::cancelled("transfer cancelled before start"));
        }

        let existing = self.resume.get(&entry.path)?;

        if existing.is_none() && !self.options.overwrite {
            if let Ok(meta) = fs::metadata(target) {
                return match entry.measured_size() {
                    Some(size) if meta.len() == size => Ok(Plan::Skip("already present".into())),
                    Some(size) => Err(BridgeError::invalid_parameter(format!(
                        "target already exists with {} bytes, source has {}",
                        meta.len(),
                        size
                    ))
                    .with_context("target_path", target.display())),
                    None => Ok(Plan::Skip("already present (size unverified)".into())),
                };
            }
        }

        let existing = match existing {
            Some(state) if state.target_path != target => {
                tracing::info!(
                    previous = %state.target_path.display(),
                    "Destination changed, restarting transfer"
                );
                self.resume.clear(&entry.path)?;
                None
            }
            Some(state)
                if state.size_source.is_measured()
                    && entry.measured_size().is_some_and(|size| size != state.total_bytes) =>
            {
                tracing::info!(
                    checkpoint_total = state.total_bytes,
                    reported = entry.size,
                    "Source size changed, restarting transfer"
                );
                self.resume.clear(&entry.path)?;
                None
            }
            other => other,
        };

        let state = match existing {
            Some(state) => {
                let temp_len = fs::metadata(&state.temp_path).map(|m| m.len()).unwrap_or(0);
                if temp_len < state.copied_bytes {
                    tracing::warn!(
                        temp_len,
                        checkpoint = state.copied_bytes,
                        "Temp file shorter than checkpoint, restarting transfer"
                    );
                    self.resume.clear(&entry.path)?;
                    self.resume.begin(entry, target, self.options.chunk_size)
                } else {
                    state
                }
            }
            None => self.resume.begin(entry, target, self.options.chunk_size),
        };

        Ok(Plan::Copy(state))
    }

    fn copy(
        &self,
        entry: &RemoteFileEntry,
        mut state: ResumeState,
        cancel: &CancellationToken,
    ) -> Result<Copied> {
        let resumed_from = state.copied_bytes;
        let persisted = self.resume.get(&entry.path)?.is_some();

        if let Some(parent) = state.temp_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let expected = if persisted && state.is_complete() {
            tracing::debug!(copied = state.copied_bytes, "Checkpoint already complete, finalizing");
            self.recorded_digest(&state)?
        } else {
            if resumed_from > 0 {
                tracing::info!(offset = resumed_from, "Resuming transfer");
            }
            self.emit(TransferEvent::Started {
                path: entry.path.clone(),
                resumed_from,
                total: entry.measured_size(),
            });
            self.stream_into_temp(entry, &mut state, persisted, cancel)?
        };

        self.resume.finalize(&state)?;

        let digest = match self.verifier.verify(&state.target_path, &expected) {
            Ok(actual) => actual,
            Err(e) => {
                if let Err(remove_err) = fs::remove_file(&state.target_path) {
                    tracing::warn!(error = %remove_err, "Failed to remove corrupt target");
                }
                return Err(e);
            }
        };

        Ok(Copied {
            bytes_copied: state.copied_bytes - resumed_from,
            resumed_from,
            digest,
        })
    }

    /// Digest stored at the final checkpoint, or a fresh hash of the temp file.
    fn recorded_digest(&self, state: &ResumeState) -> Result<String> {
        let algorithm = self.verifier.algorithm();
        match (
            state.metadata.get(DIGEST_KEY),
            state.metadata.get(DIGEST_ALGORITHM_KEY),
        ) {
            (Some(digest), Some(name)) if name == algorithm.as_str() => Ok(digest.clone()),
            _ => self.verifier.calculate_hash(&state.temp_path),
        }
    }

    /// Copies the remaining bytes and returns the running digest of the
    /// whole temp file.
    fn stream_into_temp(
        &self,
        entry: &RemoteFileEntry,
        state: &mut ResumeState,
        mut persisted: bool,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut temp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&state.temp_path)
            .map_err(|e| {
                BridgeError::from(e).with_context("temp_path", state.temp_path.display())
            })?;

        // Drop whatever was written after the last checkpoint.
        temp.set_len(state.copied_bytes)?;
        let mut hasher = self.verifier.hasher();
        if state.copied_bytes > 0 {
            temp.seek(SeekFrom::Start(0))?;
            hasher.update_from(&mut (&mut temp).take(state.copied_bytes))?;
        }
        temp.seek(SeekFrom::Start(state.copied_bytes))?;

        let mut stream = self.channel.get_file_stream(&entry.path)?;
        position_stream(stream.as_mut(), state.copied_bytes)?;

        let interval = self.options.checkpoint_interval;
        let mut next_checkpoint = (state.copied_bytes / interval + 1) * interval;
        let mut buffer = vec![0u8; usize::try_from(self.options.chunk_size).unwrap_or(usize::MAX)];
        let measured_total = state.size_source.is_measured().then_some(state.total_bytes);

        loop {
            if cancel.is_cancelled() {
                self.checkpoint_after_error(state, &temp, &mut persisted);
                return Err(BridgeError::cancelled("transfer cancelled")
                    .with_context("copied_bytes", state.copied_bytes));
            }

            let want = match measured_total {
                Some(total) => self
                    .options
                    .chunk_size
                    .min(total.saturating_sub(state.copied_bytes)),
                None => self.options.chunk_size,
            };
            if want == 0 {
                break;
            }
            // `want` never exceeds the buffer length.
            let want = want as usize;

            let n = match read_chunk(stream.as_mut(), &mut buffer[..want]) {
                Ok(n) => n,
                Err(e) if cancel.is_cancelled() => {
                    self.checkpoint_after_error(state, &temp, &mut persisted);
                    return Err(BridgeError::cancelled("transfer cancelled")
                        .with_source(e)
                        .with_context("copied_bytes", state.copied_bytes));
                }
                Err(e) => {
                    self.checkpoint_after_error(state, &temp, &mut persisted);
                    return Err(BridgeError::from(e)
                        .with_context("offset", state.copied_bytes)
                        .with_context("source_path", &entry.path));
                }
            };

            if n == 0 {
                if let Some(total) = measured_total {
                    self.checkpoint_after_error(state, &temp, &mut persisted);
                    return Err(BridgeError::transport(format!(
                        "stream ended at {} of {} bytes",
                        state.copied_bytes, total
                    )));
                }
                break;
            }

            if let Err(e) = temp.write_all(&buffer[..n]) {
                self.checkpoint_after_error(state, &temp, &mut persisted);
                return Err(
                    BridgeError::from(e).with_context("temp_path", state.temp_path.display())
                );
            }
            hasher.update(&buffer[..n]);
            state.copied_bytes += n as u64;

            if !persisted || state.copied_bytes >= next_checkpoint {
                self.checkpoint(state, &temp, None)?;
                persisted = true;
                next_checkpoint = (state.copied_bytes / interval + 1) * interval;
            }
        }

        if measured_total.is_none() {
            state.total_bytes = state.copied_bytes;
            state.size_source = SizeSource::Measured;
        }

        let digest = hasher.snapshot();
        self.checkpoint(state, &temp, Some(&hasher))?;
        Ok(digest)
    }

    /// Syncs the temp file and persists `state`.
    fn checkpoint(
        &self,
        state: &mut ResumeState,
        temp: &File,
        digest: Option<&StreamingDigest>,
    ) -> Result<()> {
        temp.sync_data()?;
        if let Some(digest) = digest {
            state
                .metadata
                .insert(DIGEST_KEY.to_string(), digest.snapshot());
            state.metadata.insert(
                DIGEST_ALGORITHM_KEY.to_string(),
                self.verifier.algorithm().to_string(),
            );
        }
        self.resume.checkpoint(state)?;
        self.emit(TransferEvent::Checkpoint {
            path: state.source_path.clone(),
            copied_bytes: state.copied_bytes,
            total_bytes: state.size_source.is_measured().then_some(state.total_bytes),
        });
        Ok(())
    }

    /// Persists progress made before a failure. Errors here are logged only;
    /// the original failure is what the caller sees.
    fn checkpoint_after_error(&self, state: &mut ResumeState, temp: &File, persisted: &mut bool) {
        if state.copied_bytes == 0 && !*persisted {
            return;
        }
        match self.checkpoint(state, temp, None) {
            Ok(()) => *persisted = true,
            Err(e) => tracing::warn!(error = %e, "Failed to persist checkpoint after error"),
        }
    }

    fn emit(&self, event: TransferEvent) {
        if let Some(ref events) = self.events {
            let _ = events.send(event);
        }
    }
}

/// Moves `stream` to `offset`, reading and discarding if it cannot seek.
fn position_stream(stream: &mut dyn RemoteStream, offset: u64) -> Result<()> {
    if offset == 0 || stream.try_seek(offset)? {
        return Ok(());
    }

    let skipped = io::copy(&mut stream.take(offset), &mut io::sink())?;
    if skipped < offset {
        return Err(BridgeError::transport(format!(
            "stream ended at {skipped} bytes while skipping to resume offset {offset}"
        )));
    }
    Ok(())
}

/// Fills `buf` unless the stream ends first. Returns the bytes read.
///
/// A failure discards the partially filled chunk.
fn read_chunk(stream: &mut dyn RemoteStream, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
