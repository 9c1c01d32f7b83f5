//! Bounded parallel transfers.
//!
//! Each file runs as one [`TransferSession`] on the blocking thread pool
//! while holding a semaphore permit. Cancelling the pool's token stops
//! sessions between chunks and keeps their checkpoints; files still waiting
//! for a permit are reported as cancelled without touching the device.

use std::path::Path;
use std::sync::Arc;

use access::{AccessChannel, BridgeError, RemoteFileEntry, TransferResult};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::integrity::IntegrityVerifier;
use super::resume::ResumeManager;
use super::session::{TransferOptions, TransferSession};
use super::validation::resolve_under;
use super::TransferEvent;

/// Capacity of the progress event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Runs many transfers from one channel in parallel.
pub struct TransferPool {
    session: TransferSession,
    max_concurrency: usize,
    cancel: CancellationToken,
    event_tx: broadcast::Sender<TransferEvent>,
}

impl TransferPool {
    /// Creates a pool running at most `max(1, max_concurrency)` files at once.
    pub fn new(
        channel: Arc<dyn AccessChannel>,
        resume: Arc<ResumeManager>,
        verifier: IntegrityVerifier,
        options: TransferOptions,
        max_concurrency: usize,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let session =
            TransferSession::new(channel, resume, verifier, options).with_events(event_tx.clone());
        Self {
            session,
            max_concurrency: max_concurrency.max(1),
            cancel: CancellationToken::new(),
            event_tx,
        }
    }

    /// Uses `token` for cancellation instead of the pool's own.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Subscribe to progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.event_tx.subscribe()
    }

    /// Token that cancels every transfer of this pool.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        tracing::info!("Cancelling transfers");
        self.cancel.cancel();
    }

    /// Transfers every entry to `dest`/`relative_path`.
    ///
    /// Returns one result per entry, in input order.
    pub async fn transfer_all(
        &self,
        entries: Vec<RemoteFileEntry>,
        dest: &Path,
    ) -> Vec<TransferResult> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();
        let mut results: Vec<(usize, TransferResult)> = Vec::with_capacity(entries.len());

        tracing::info!(
            files = entries.len(),
            concurrency = self.max_concurrency,
            dest = %dest.display(),
            "Starting transfers"
        );

        for (index, entry) in entries.into_iter().enumerate() {
            let target = match resolve_under(dest, &entry.relative_path) {
                Ok(target) => target,
                Err(e) => {
                    tracing::warn!(
                        path = %entry.path,
                        error = %e,
                        "Rejecting unsafe relative path"
                    );
                    results.push((index, TransferResult::failed(entry, dest.to_path_buf(), e)));
                    continue;
                }
            };

            let semaphore = semaphore.clone();
            let session = self.session.clone();
            let cancel = self.cancel.clone();
            let event_tx = self.event_tx.clone();

            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let err = BridgeError::cancelled("transfer cancelled before start");
                        return (index, TransferResult::failed(entry, target, err));
                    }
                    permit = semaphore.acquire_owned() => permit,
                };
                let _permit = match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        let err = BridgeError::transport("transfer pool closed");
                        return (index, TransferResult::failed(entry, target, err));
                    }
                };

                let fallback = entry.clone();
                let fallback_target = target.clone();
                let result = tokio::task::spawn_blocking(move || {
                    session.run(&entry, &target, &cancel)
                })
                .await
                .unwrap_or_else(|e| {
                    TransferResult::failed(
                        fallback,
                        fallback_target,
                        BridgeError::transport(format!("transfer task failed: {e}")),
                    )
                });

                let _ = event_tx.send(TransferEvent::Finished {
                    path: result.file.path.clone(),
                    success: result.success,
                    skipped: result.skipped,
                    bytes_copied: result.bytes_copied,
                });
                (index, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(pair) => results.push(pair),
                Err(e) => tracing::error!("Transfer task panicked: {}", e),
            }
        }

        results.sort_by_key(|(index, _)| *index);
        let results: Vec<TransferResult> = results.into_iter().map(|(_, r)| r).collect();

        let succeeded = results.iter().filter(|r| r.success && !r.skipped).count();
        let skipped = results.iter().filter(|r| r.skipped).count();
        let failed = results.iter().filter(|r| !r.success).count();
        tracing::info!(succeeded, skipped, failed, "Transfers finished");

        results
    }
}
