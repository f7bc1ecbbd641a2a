//! Error types for strata_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using strata_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during worker, content, snapshot and lease operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from the backing filesystem. Retryable.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// The named object does not exist.
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// The named object already exists.
    #[error("{kind} already exists: {key}")]
    AlreadyExists { kind: &'static str, key: String },

    /// The operation is not valid for the object's lifecycle stage.
    #[error("Invalid state for {key}: {reason}")]
    InvalidState { key: String, reason: String },

    /// The object is referenced by a descendant, lease or root label.
    #[error("{key} is in use: {reason}")]
    InUse { key: String, reason: String },

    /// Content integrity failure during ingestion.
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Invalid worker configuration.
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// A long-running operation was cancelled by its caller.
    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    /// Stored object file is corrupted or invalid.
    #[error("Corrupted object at {path}: {reason}")]
    CorruptedObject { path: PathBuf, reason: String },

    /// Invalid digest format or encoding.
    #[error("Invalid digest: {reason}")]
    InvalidDigest { reason: String },

    /// Invalid snapshot key, lease id, ingest ref or label name.
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Metadata store could not be encoded or decoded.
    #[error("Metadata error: {source}")]
    Metadata {
        #[from]
        source: serde_json::Error,
    },

    /// Compression or decompression failed.
    #[error("Compression error: {reason}")]
    Compression { reason: String },
}

impl Error {
    /// Create a NotFound error.
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(kind: &'static str, key: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind,
            key: key.into(),
        }
    }

    /// Create an InvalidState error.
    pub fn invalid_state(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidState {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an InUse error.
    pub fn in_use(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InUse {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a DigestMismatch error.
    pub fn digest_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Error::DigestMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a Config error.
    pub fn config(reason: impl Into<String>) -> Self {
        Error::Config {
            reason: reason.into(),
        }
    }

    /// Create a Cancelled error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Error::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a CorruptedObject error.
    pub fn corrupted_object(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CorruptedObject {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidDigest error.
    pub fn invalid_digest(reason: impl Into<String>) -> Self {
        Error::InvalidDigest {
            reason: reason.into(),
        }
    }

    /// Create an InvalidKey error.
    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Error::InvalidKey {
            reason: reason.into(),
        }
    }

    /// Create a Compression error.
    pub fn compression_error(reason: impl Into<String>) -> Self {
        Error::Compression {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io { .. })
    }

    /// Whether this is a NotFound error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

// Additional From implementations for external error types

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<ignore::Error> for Error {
    fn from(err: ignore::Error) -> Self {
        // ignore::Error can wrap an io::Error or be a path error
        match err.io_error() {
            Some(io_err) => Error::Io {
                source: std::io::Error::new(io_err.kind(), io_err.to_string()),
            },
            None => Error::Io {
                source: std::io::Error::other(err.to_string()),
            },
        }
    }
}
