//! Error types for zip-dl
//!
//! This module provides the error handling for the library:
//! - [`DownloadErrorKind`] - the closed failure taxonomy recorded on a request
//! - [`DownloadError`] - a tagged failure with message and the blob it relates to
//! - [`Error`] - the crate-level error returned by service and API operations
//! - HTTP status code mapping and structured API error bodies

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{BlobReference, DownloadStatus, RequestId};

/// Result type alias for zip-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for zip-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "limits.max_files")
        key: Option<String>,
    },

    /// A request failed with a tagged download error
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// A status change was attempted that the transition table does not allow
    #[error("illegal status transition for request {id}: {from} -> {to}")]
    InvalidTransition {
        /// The request whose transition was rejected
        id: RequestId,
        /// Status at the time of the attempt
        from: DownloadStatus,
        /// Requested target status
        to: DownloadStatus,
    },

    /// Request not found
    #[error("request not found: {0}")]
    NotFound(RequestId),

    /// Operation not possible in the request's current state
    #[error("cannot {operation} request {id} in state {current_state}")]
    InvalidState {
        /// The request the operation targeted
        id: RequestId,
        /// The operation that was attempted (e.g., "cancel")
        operation: String,
        /// The status that prevents the operation
        current_state: DownloadStatus,
    },

    /// Shutdown in progress - not accepting new requests
    #[error("shutdown in progress: not accepting new requests")]
    ShuttingDown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// API server error
    #[error("API server error: {0}")]
    ApiServerError(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a configuration error for the given key
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// The download error category this error is recorded under
    ///
    /// Contract violations (illegal transitions) and anything without a natural
    /// category map to [`DownloadErrorKind::Unknown`].
    pub fn kind(&self) -> DownloadErrorKind {
        match self {
            Error::Download(e) => e.kind,
            Error::Config { .. } => DownloadErrorKind::Validation,
            Error::NotFound(_) => DownloadErrorKind::Validation,
            Error::InvalidState { .. } => DownloadErrorKind::Validation,
            Error::Network(_) => DownloadErrorKind::Network,
            Error::Io(e) if e.kind() == std::io::ErrorKind::OutOfMemory => {
                DownloadErrorKind::Memory
            }
            Error::Io(_) => DownloadErrorKind::Storage,
            Error::InvalidTransition { .. }
            | Error::ShuttingDown
            | Error::Serialization(_)
            | Error::ApiServerError(_)
            | Error::Other(_) => DownloadErrorKind::Unknown,
        }
    }

    /// Convert into the [`DownloadError`] recorded on a failed request
    pub fn into_download_error(self) -> DownloadError {
        match self {
            Error::Download(e) => e,
            other => DownloadError::new(other.kind(), other.to_string()),
        }
    }
}

/// Categories of failures that can end a ZIP download request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadErrorKind {
    /// Malformed or inconsistent request
    #[serde(rename = "validation_error")]
    Validation,
    /// A requested blob does not exist
    #[serde(rename = "file_not_found")]
    FileNotFound,
    /// A per-file or total size cap was exceeded
    #[serde(rename = "size_limit_exceeded")]
    SizeLimitExceeded,
    /// Too many or too few files requested
    #[serde(rename = "count_limit_exceeded")]
    CountLimitExceeded,
    /// A per-blob or overall deadline elapsed
    #[serde(rename = "timeout_error")]
    Timeout,
    /// Memory budget exhausted
    #[serde(rename = "memory_error")]
    Memory,
    /// Storage service failure
    #[serde(rename = "storage_error")]
    Storage,
    /// Archive could not be written
    #[serde(rename = "compression_error")]
    Compression,
    /// Transport failure talking to storage
    #[serde(rename = "network_error")]
    Network,
    /// Storage refused access
    #[serde(rename = "permission_error")]
    Permission,
    /// The SAS token service failed
    #[serde(rename = "sas_service_error")]
    SasService,
    /// Anything else, including internal contract violations
    #[serde(rename = "unknown_error")]
    Unknown,
}

impl DownloadErrorKind {
    /// Every kind, in declaration order
    pub const ALL: [DownloadErrorKind; 12] = [
        DownloadErrorKind::Validation,
        DownloadErrorKind::FileNotFound,
        DownloadErrorKind::SizeLimitExceeded,
        DownloadErrorKind::CountLimitExceeded,
        DownloadErrorKind::Timeout,
        DownloadErrorKind::Memory,
        DownloadErrorKind::Storage,
        DownloadErrorKind::Compression,
        DownloadErrorKind::Network,
        DownloadErrorKind::Permission,
        DownloadErrorKind::SasService,
        DownloadErrorKind::Unknown,
    ];

    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadErrorKind::Validation => "validation_error",
            DownloadErrorKind::FileNotFound => "file_not_found",
            DownloadErrorKind::SizeLimitExceeded => "size_limit_exceeded",
            DownloadErrorKind::CountLimitExceeded => "count_limit_exceeded",
            DownloadErrorKind::Timeout => "timeout_error",
            DownloadErrorKind::Memory => "memory_error",
            DownloadErrorKind::Storage => "storage_error",
            DownloadErrorKind::Compression => "compression_error",
            DownloadErrorKind::Network => "network_error",
            DownloadErrorKind::Permission => "permission_error",
            DownloadErrorKind::SasService => "sas_service_error",
            DownloadErrorKind::Unknown => "unknown_error",
        }
    }
}

impl std::fmt::Display for DownloadErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DownloadErrorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        DownloadErrorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown download error kind: {s}"))
    }
}

/// A tagged failure attached to a request
///
/// Carries the category, a human-readable message, and the blob the failure
/// relates to when there is one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct DownloadError {
    /// Failure category
    pub kind: DownloadErrorKind,
    /// Human-readable description
    pub message: String,
    /// The blob this failure relates to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<BlobReference>,
}

impl DownloadError {
    /// Create an error with no related blob
    pub fn new(kind: DownloadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            blob: None,
        }
    }

    /// Attach the blob this error relates to
    #[must_use]
    pub fn with_blob(mut self, blob: &BlobReference) -> Self {
        self.blob = Some(blob.clone());
        self
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(DownloadErrorKind::Validation, message)
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(DownloadErrorKind::Timeout, message)
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(DownloadErrorKind::Storage, message)
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(DownloadErrorKind::Network, message)
    }

    /// Create a compression error
    pub fn compression(message: impl Into<String>) -> Self {
        Self::new(DownloadErrorKind::Compression, message)
    }

    /// Create a SAS service error
    pub fn sas_service(message: impl Into<String>) -> Self {
        Self::new(DownloadErrorKind::SasService, message)
    }

    /// Classify a local I/O failure (spool files, archive sink)
    ///
    /// Out-of-memory conditions become [`DownloadErrorKind::Memory`], everything
    /// else takes the supplied kind.
    pub fn from_io(kind: DownloadErrorKind, context: &str, err: &std::io::Error) -> Self {
        let kind = if err.kind() == std::io::ErrorKind::OutOfMemory {
            DownloadErrorKind::Memory
        } else {
            kind
        };
        Self::new(kind, format!("{context}: {err}"))
    }
}

/// Why a pipeline stage stopped early
///
/// Cancellation is not a failure: it ends the request in `cancelled`, not `failed`.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// The request's cancellation token fired
    #[error("cancelled")]
    Cancelled,
    /// The stage failed
    #[error(transparent)]
    Failed(#[from] DownloadError),
}

/// API error response format
///
/// # Example JSON Response
///
/// ```json
/// {
///   "error": {
///     "code": "count_limit_exceeded",
///     "message": "26 files requested, at most 25 allowed",
///     "details": {
///       "request_id": "0b8f0c5e-5f1e-4c39-9a3a-4b0a3d2f3f77"
///     }
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "not_found", "validation_error")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional context about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// Create an API error with additional details
    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: Some(details),
            },
        }
    }

    /// Create a "not found" error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new("not_found", format!("{} not found", resource.into()))
    }

    /// Create a "validation error" error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("validation_error", message)
    }
}

/// Convert errors to HTTP status codes for API responses
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for DownloadErrorKind {
    fn status_code(&self) -> u16 {
        match self {
            DownloadErrorKind::Validation => 400,
            DownloadErrorKind::CountLimitExceeded => 400,
            DownloadErrorKind::FileNotFound => 404,
            DownloadErrorKind::SizeLimitExceeded => 413,
            DownloadErrorKind::Permission => 403,
            DownloadErrorKind::Storage | DownloadErrorKind::Network => 502,
            DownloadErrorKind::SasService => 503,
            DownloadErrorKind::Timeout => 504,
            DownloadErrorKind::Memory
            | DownloadErrorKind::Compression
            | DownloadErrorKind::Unknown => 500,
        }
    }

    fn error_code(&self) -> &str {
        self.as_str()
    }
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            Error::Config { .. } => 400,
            Error::Download(e) => e.kind.status_code(),
            Error::NotFound(_) => 404,
            Error::InvalidState { .. } => 409,
            Error::ShuttingDown => 503,
            Error::Network(_) => 502,
            Error::InvalidTransition { .. }
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::ApiServerError(_)
            | Error::Other(_) => 500,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Download(e) => e.kind.as_str(),
            Error::InvalidTransition { .. } => DownloadErrorKind::Unknown.as_str(),
            Error::NotFound(_) => "not_found",
            Error::InvalidState { .. } => "invalid_state",
            Error::ShuttingDown => "shutting_down",
            Error::Io(_) => "io_error",
            Error::Network(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
            Error::ApiServerError(_) => "api_server_error",
            Error::Other(_) => "internal_error",
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();
        let message = error.to_string();

        let details = match &error {
            Error::Download(DownloadError {
                blob: Some(blob), ..
            }) => Some(serde_json::json!({
                "blob_path": blob.path,
                "blob_size": blob.size,
            })),
            Error::NotFound(id) => Some(serde_json::json!({
                "request_id": id,
            })),
            Error::InvalidState {
                id,
                operation,
                current_state,
            } => Some(serde_json::json!({
                "request_id": id,
                "operation": operation,
                "current_state": current_state,
            })),
            Error::InvalidTransition { id, from, to } => Some(serde_json::json!({
                "request_id": id,
                "from": from,
                "to": to,
            })),
            Error::Config { key: Some(key), .. } => Some(serde_json::json!({
                "key": key,
            })),
            _ => None,
        };

        ApiError {
            error: ErrorDetail {
                code,
                message,
                details,
            },
        }
    }
}
