//! # devbridge
//!
//! Retrieves files from a device that is only reachable through several
//! unreliable access channels: mounted filesystems, shell automation and
//! metadata queries.
//!
//! ## Overview
//!
//! - **Device bridging**: enumerate attached devices, resolve them to an
//!   address per access method and connect the first channel that works
//! - **Adaptive retry**: per-method success statistics steer scans away from
//!   methods that keep failing
//! - **Resumable transfers**: chunked copies checkpointed to disk, resumed
//!   after interruption and verified with a digest before they count as done
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          devbridge CLI                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │ DeviceBridge │─▶│ RetryManager │  │     TransferPool     │  │
//! │  └──────┬───────┘  └──────────────┘  └──────────┬───────────┘  │
//! │         │                                        │              │
//! │  ┌──────▼──────────────────────┐  ┌─────────────▼───────────┐  │
//! │  │ resolvers → access channels │  │ TransferSession         │  │
//! │  │ (fs / shell / metadata)     │  │ ResumeManager, digests  │  │
//! │  └─────────────────────────────┘  └─────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bridge::{Config, DeviceBridge, RetryManager};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let retry = Arc::new(RetryManager::new(config.retry.policy()));
//!     let bridge = DeviceBridge::from_config(&config, retry.clone());
//!
//!     let files = retry.scan_with_retry(&bridge, "Camera", "DCIM")?;
//!     println!("{} files", files.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`devices`]: Enumeration, path resolvers and the device bridge
//! - [`channels`]: Filesystem, shell and metadata access channels
//! - [`retry`]: Method statistics and fallback scanning
//! - [`transfer`]: Checkpoints, digests, sessions and the transfer pool
//! - [`logging`]: Subscriber setup for the binary

pub mod channels;
pub mod config;
pub mod devices;
pub mod logging;
pub mod retry;
pub mod transfer;

#[cfg(test)]
mod testing;

// Re-export the access layer for convenience
pub use access;

pub use config::Config;

pub use channels::{ChannelFactory, DefaultChannelFactory};

pub use devices::{DeviceBridge, DeviceEnumerator};

pub use retry::{MethodStatistics, RetryManager, RetryPolicy, ScanOutcome, ScanProvider};

pub use transfer::{
    DigestAlgorithm, IntegrityVerifier, ResumeManager, ResumeState, TransferEvent,
    TransferOptions, TransferPool, TransferSession,
};
