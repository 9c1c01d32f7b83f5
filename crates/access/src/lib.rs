//! # devbridge access layer
//!
//! Contracts and data model shared by every devbridge component.
//!
//! The external device is reachable only through several unreliable access
//! channels. This crate defines what a channel is ([`AccessChannel`]), how a
//! device identity becomes an address ([`PathResolver`]), the records that flow
//! between components ([`RemoteFileEntry`], [`AccessResult`],
//! [`TransferResult`]) and the single error type ([`BridgeError`]).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     DeviceBridge / RetryManager         │  bridge crate
//! ├─────────────────────────────────────────┤
//! │  PathResolver  │  AccessChannel trait   │  this crate
//! ├─────────────────────────────────────────┤
//! │  mount points │ shell │ metadata query  │  concrete channels
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`channel`]: channel, stream and resolver traits
//! - [`types`]: device descriptors, file entries, access and transfer results
//! - [`error`]: error codes and [`BridgeError`]

pub mod channel;
pub mod error;
pub mod types;

pub use channel::{AccessChannel, PathResolver, RemoteStream};
pub use error::{BridgeError, ErrorCode, Result};
pub use types::{
    AccessMethod, AccessResult, DeviceDescriptor, RemoteFileEntry, SizeSource, TransferResult,
};
