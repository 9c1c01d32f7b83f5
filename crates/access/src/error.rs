//! Error types for the access crate.
//!
//! Every failure surfaced to callers is a [`BridgeError`]: a machine-checkable
//! [`ErrorCode`], a human message, an optional wrapped cause, a free-form
//! context map and a retryable flag.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-checkable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The device is not present or no access method could reach it.
    DeviceNotFound,
    /// The host refused access to the device or one of its files.
    AccessDenied,
    /// The device is present but currently claimed by something else.
    DeviceBusy,
    /// The requested operation is not available on this channel or host.
    NotSupported,
    /// An operation exceeded its time budget.
    Timeout,
    /// A caller supplied an invalid argument or malformed data.
    InvalidParameter,
    /// Channel-specific plumbing failure (subprocess, filesystem, parse).
    TransportFailure,
    /// A finalized file does not match its expected digest.
    IntegrityMismatch,
    /// The operation was cancelled before it could complete.
    Cancelled,
}

impl ErrorCode {
    /// Whether errors with this code are retryable unless stated otherwise.
    pub fn default_retryable(self) -> bool {
        match self {
            ErrorCode::DeviceBusy
            | ErrorCode::Timeout
            | ErrorCode::AccessDenied
            | ErrorCode::TransportFailure
            | ErrorCode::Cancelled => true,
            ErrorCode::DeviceNotFound
            | ErrorCode::NotSupported
            | ErrorCode::InvalidParameter
            | ErrorCode::IntegrityMismatch => false,
        }
    }

    /// Stable snake_case name, used in logs and context dumps.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::DeviceNotFound => "device_not_found",
            ErrorCode::AccessDenied => "access_denied",
            ErrorCode::DeviceBusy => "device_busy",
            ErrorCode::NotSupported => "not_supported",
            ErrorCode::Timeout => "timeout",
            ErrorCode::InvalidParameter => "invalid_parameter",
            ErrorCode::TransportFailure => "transport_failure",
            ErrorCode::IntegrityMismatch => "integrity_mismatch",
            ErrorCode::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single error type surfaced by devbridge.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct BridgeError {
    code: ErrorCode,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    context: BTreeMap<String, String>,
    retryable: bool,
}

/// Result type alias for devbridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Creates an error with the code's default retryability.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
            retryable: code.default_retryable(),
        }
    }

    pub fn device_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeviceNotFound, message)
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AccessDenied, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotSupported, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParameter, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TransportFailure, message)
    }

    pub fn integrity_mismatch(expected: &str, actual: &str) -> Self {
        Self::new(
            ErrorCode::IntegrityMismatch,
            format!("digest mismatch: expected {expected}, got {actual}"),
        )
        .with_context("expected_digest", expected)
        .with_context("actual_digest", actual)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    /// Attaches an underlying cause.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Adds one context entry, replacing any previous value for `key`.
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    /// Overrides the retryable flag.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Returns `true` if this error carries the given code.
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code
    }

    /// Renders the message followed by every context entry, one per line.
    pub fn detailed(&self) -> String {
        let mut out = self.to_string();
        for (key, value) in &self.context {
            out.push_str(&format!("\n  {key}: {value}"));
        }
        out
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let code = match err.kind() {
            ErrorKind::TimedOut => ErrorCode::Timeout,
            ErrorKind::PermissionDenied => ErrorCode::AccessDenied,
            ErrorKind::ResourceBusy => ErrorCode::DeviceBusy,
            _ => ErrorCode::TransportFailure,
        };
        BridgeError::new(code, err.to_string()).with_source(err)
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::invalid_parameter(format!("malformed JSON: {err}")).with_source(err)
    }
}
