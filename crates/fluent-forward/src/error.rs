//! Error taxonomy for the forwarder pipeline.
//!
//! Errors are split by where they can be handled. `BufferError` is producer
//! backpressure; `SendError` covers everything the sender stack can retry or
//! fail over. The public surface reports `EmitError`.

use std::io;
use std::time::Duration;

/// Invalid configuration detected while constructing a forwarder.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one endpoint is required")]
    NoEndpoints,

    #[error("chunk_expand_ratio must be greater than 1.0, got {0}")]
    InvalidExpandRatio(f64),

    #[error("chunk_initial_size must be non-zero")]
    ZeroChunkSize,

    #[error(
        "chunk sizes must satisfy chunk_initial_size <= chunk_retention_size <= max_buffer_size"
    )]
    InvalidChunkSizes,

    #[error("failed to prepare file backup directory: {0}")]
    Backup(#[source] io::Error),
}

/// Producer-side backpressure and validation errors from the chunk buffer.
///
/// `Full` is recoverable: the caller can retry after the flusher has drained
/// space. `InvalidTag` is a programmer error and is never retried.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("buffer full: {needed} more bytes would exceed the {limit} byte budget ({allocated} allocated)")]
    Full {
        needed: usize,
        allocated: usize,
        limit: usize,
    },

    #[error("invalid tag: {0:?}")]
    InvalidTag(String),

    #[error("entry encoding failed: {0}")]
    Encode(#[source] io::Error),
}

impl BufferError {
    pub fn is_full(&self) -> bool {
        matches!(self, BufferError::Full { .. })
    }
}

/// Failures surfaced by the sender stack.
///
/// Transient I/O and ack-protocol errors are retried by the retrying wrapper;
/// `RetryOver` is terminal and carries the last underlying failure.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("i/o error on connection to {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("no ack response within {0:?}")]
    AckTimeout(Duration),

    #[error("ack response could not be decoded: {0}")]
    AckDecode(String),

    #[error("ack token mismatch: expected {expected:?}, got {got:?}")]
    AckMismatch { expected: String, got: String },

    #[error("no endpoint is available")]
    NoAvailableEndpoint,

    #[error("request framing failed: {0}")]
    Framing(#[source] io::Error),

    #[error("retry over after {attempts} attempts: {source}")]
    RetryOver {
        attempts: u32,
        #[source]
        source: Box<SendError>,
    },

    #[error("sender is closed")]
    Closed,
}

impl SendError {
    /// Terminal errors are not worth another attempt on any endpoint.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SendError::RetryOver { .. } | SendError::Closed)
    }
}

/// Errors reported by the public emit surface.
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("record must be a map")]
    RecordNotAMap,

    #[error("record serialization failed: {0}")]
    Serialize(#[source] rmp_serde::encode::Error),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("forwarder is closed")]
    Terminated,
}
