//! Checkpointed, verified, resumable file transfers.
//!
//! - [`resume`]: persisted checkpoints and temp file bookkeeping
//! - [`integrity`]: digests and verification of finalized files
//! - [`session`]: one file's copy
//! - [`pool`]: many files in parallel with cancellation
//! - [`validation`]: device-reported relative paths

pub mod integrity;
pub mod pool;
pub mod resume;
pub mod session;
pub mod validation;

pub use integrity::{DigestAlgorithm, IntegrityVerifier, StreamingDigest};
pub use pool::TransferPool;
pub use resume::{ResumeManager, ResumeState};
pub use session::{TransferOptions, TransferSession};
pub use validation::{resolve_under, validate_relative_path};

use access::RemoteFileEntry;

/// Progress notifications published while transfers run.
///
/// `path` is the channel path of the file ([`RemoteFileEntry::path`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// Bytes are about to be read from the device.
    Started {
        path: String,
        resumed_from: u64,
        total: Option<u64>,
    },
    /// A checkpoint was persisted.
    Checkpoint {
        path: String,
        copied_bytes: u64,
        total_bytes: Option<u64>,
    },
    /// The file reached a final outcome.
    Finished {
        path: String,
        success: bool,
        skipped: bool,
        bytes_copied: u64,
    },
}

/// Marks each entry whose extension is in `extensions` as a target type.
///
/// An empty extension list marks every entry.
pub fn classify_targets(entries: &mut [RemoteFileEntry], extensions: &[String]) {
    for entry in entries.iter_mut() {
        entry.is_target_type = extensions.is_empty()
            || entry
                .extension()
                .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)));
    }
}
