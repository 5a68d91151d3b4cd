//! Plain value-typed configuration records consumed by [`Forwarder::new`].
//!
//! Every knob carries the documented default via `Default`, so a minimal
//! setup is `ForwarderConfig::default()` pointing at `127.0.0.1:24224`.
//!
//! [`Forwarder::new`]: crate::Forwarder::new

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ConfigError, SendError};

/// A Forward-protocol upstream address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::new("127.0.0.1", 24224)
    }
}

/// Sizing and retention knobs for the per-tag chunk buffer.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Global budget across all current and sealed chunks.
    pub max_buffer_size: usize,
    /// Capacity of a freshly created chunk.
    pub chunk_initial_size: usize,
    /// A chunk is sealed once its size reaches this, and its capacity never
    /// grows past it (except for a single oversized event).
    pub chunk_retention_size: usize,
    /// Growth factor applied when a chunk runs out of room.
    pub chunk_expand_ratio: f64,
    /// A chunk is sealed once it has been open this long.
    pub chunk_retention_time: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            max_buffer_size: 512 * 1024 * 1024,
            chunk_initial_size: 1024 * 1024,
            chunk_retention_size: 4 * 1024 * 1024,
            chunk_expand_ratio: 2.0,
            chunk_retention_time: Duration::from_millis(1000),
        }
    }
}

/// Flush cadence and shutdown bounds.
#[derive(Debug, Clone)]
pub struct FlusherConfig {
    pub flush_interval: Duration,
    /// How long `close` keeps force-flushing before giving up on a drain.
    pub wait_until_buffer_flushed: Duration,
    /// How long `close` waits for the flush worker to exit.
    pub wait_until_terminated: Duration,
}

impl Default for FlusherConfig {
    fn default() -> Self {
        FlusherConfig {
            flush_interval: Duration::from_millis(600),
            wait_until_buffer_flushed: Duration::from_secs(60),
            wait_until_terminated: Duration::from_secs(60),
        }
    }
}

/// Whether flushing runs on a dedicated worker task or inline on the
/// emitting caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    #[default]
    Async,
    Sync,
}

/// Socket-level timeouts for a single TCP sender.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub connection_timeout: Duration,
    pub read_timeout: Duration,
    /// Grace period on close so an in-flight ack can still arrive.
    pub wait_before_close: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            connection_timeout: Duration::from_millis(5000),
            read_timeout: Duration::from_millis(5000),
            wait_before_close: Duration::from_millis(1000),
        }
    }
}

/// Retry schedule for the retrying sender wrapper.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retry_count: u32,
    pub base_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retry_count: 7,
            base_interval: Duration::from_millis(400),
            max_interval: Duration::from_millis(30000),
        }
    }
}

/// Probe transport for endpoint liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatTransport {
    #[default]
    Tcp,
    Udp,
}

/// Heartbeat probe and failure-detector tuning.
///
/// Probes are only started for multi-endpoint (failover) configurations; a
/// single-endpoint sender always reports available and relies on retries.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub transport: HeartbeatTransport,
    pub interval: Duration,
    pub phi_threshold: f64,
    /// How long suspicion (or an explicit send failure) must persist before
    /// the endpoint is skipped.
    pub failure_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            transport: HeartbeatTransport::Tcp,
            interval: Duration::from_millis(1000),
            phi_threshold: 16.0,
            failure_interval: Duration::from_millis(3000),
        }
    }
}

/// Where to spill unsent chunks on close, and the filename prefix used to
/// reclaim them on restart.
#[derive(Debug, Clone)]
pub struct FileBackupConfig {
    pub dir: PathBuf,
    /// Defaults to a sanitized `<host>_<port>` of the primary endpoint so
    /// distinct forwarders sharing a directory do not pick up each other's
    /// spill.
    pub prefix: Option<String>,
}

impl FileBackupConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileBackupConfig {
            dir: dir.into(),
            prefix: None,
        }
    }
}

/// Callback invoked with terminal send errors from the flush path.
pub type ErrorHandler = Arc<dyn Fn(&SendError) + Send + Sync>;

/// Pluggable record-map serializer; must yield a MessagePack map.
pub type RecordSerializer =
    Arc<dyn Fn(&serde_json::Value) -> Result<Vec<u8>, rmp_serde::encode::Error> + Send + Sync>;

/// Everything needed to assemble a [`Forwarder`](crate::Forwarder).
#[derive(Clone, Default)]
pub struct ForwarderConfig {
    /// Upstream aggregators; more than one enables round-robin failover with
    /// heartbeat-driven availability.
    pub endpoints: Vec<Endpoint>,
    pub buffer: BufferConfig,
    pub flusher: FlusherConfig,
    pub flush_mode: FlushMode,
    pub sender: SenderConfig,
    pub retry: RetryConfig,
    pub heartbeat: HeartbeatConfig,
    /// Request an ack token per chunk and verify the upstream echo.
    pub ack_response_mode: bool,
    pub file_backup: Option<FileBackupConfig>,
    pub error_handler: Option<ErrorHandler>,
    pub record_serializer: Option<RecordSerializer>,
}

impl ForwarderConfig {
    /// A single-endpoint configuration with all defaults.
    pub fn single(host: impl Into<String>, port: u16) -> Self {
        ForwarderConfig {
            endpoints: vec![Endpoint::new(host, port)],
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        if self.buffer.chunk_expand_ratio <= 1.0 {
            return Err(ConfigError::InvalidExpandRatio(
                self.buffer.chunk_expand_ratio,
            ));
        }
        if self.buffer.chunk_initial_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.buffer.chunk_initial_size > self.buffer.chunk_retention_size
            || self.buffer.chunk_retention_size > self.buffer.max_buffer_size
        {
            return Err(ConfigError::InvalidChunkSizes);
        }
        Ok(())
    }
}

impl fmt::Debug for ForwarderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwarderConfig")
            .field("endpoints", &self.endpoints)
            .field("buffer", &self.buffer)
            .field("flusher", &self.flusher)
            .field("flush_mode", &self.flush_mode)
            .field("sender", &self.sender)
            .field("retry", &self.retry)
            .field("heartbeat", &self.heartbeat)
            .field("ack_response_mode", &self.ack_response_mode)
            .field("file_backup", &self.file_backup)
            .field("error_handler", &self.error_handler.is_some())
            .field("record_serializer", &self.record_serializer.is_some())
            .finish()
    }
}
