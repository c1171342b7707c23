//! Error types for ChunkIO
//!
//! This module defines the common error type used throughout the system.

use thiserror::Error;

/// Common result type for ChunkIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for ChunkIO
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Chunk or volume absent on the backing store. Folds into
    /// end-of-media on reads; during a flush it means "ok to upload".
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend chunk bigger than the destination buffer, or a download
    /// delivered a different length than declared. Never retried.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Temporary condition (helper timeout, interrupted call); requeued
    /// by the worker up to the retry budget.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Helper refusal without further context (non-zero exit, broken
    /// pipe on upload); takes the same requeue path as `Transient`.
    #[error("permanent backend failure: {0}")]
    Permanent(String),

    /// The engine exhausted the retry budget for at least one chunk and
    /// is read-only until reopened.
    #[error("device is read-only after too many failed uploads")]
    Fenced,

    #[error("configuration error: {0}")]
    Config(String),

    /// Helper output did not parse (non-numeric size, malformed list
    /// line, trailing download bytes).
    #[error("helper protocol error: {0}")]
    Protocol(String),

    /// Operation on a volume that was never opened.
    #[error("volume is not open")]
    NotOpen,

    /// Write past the maximum chunked volume size.
    #[error("volume full: maximum size is {max_bytes} bytes")]
    VolumeFull { max_bytes: u64 },
}

impl Error {
    /// Create a not-found error for one chunk
    pub fn not_found(volume: &str, chunk: impl AsRef<str>) -> Self {
        Self::NotFound(format!("{volume}/{}", chunk.as_ref()))
    }

    /// Create a not-found error for a whole volume
    pub fn volume_not_found(volume: &str) -> Self {
        Self::NotFound(volume.to_string())
    }

    /// Create a transient backend error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a permanent backend error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Check if the worker retry loop applies to this error.
    ///
    /// Only transient and permanent backend failures are requeued; every
    /// other kind surfaces to the caller immediately.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Permanent(_))
    }

    /// Check if this is a not-found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
