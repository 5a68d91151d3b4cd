//! The public emit/flush/close surface.
//!
//! A [`Forwarder`] owns the whole pipeline: the per-tag chunk buffer, the
//! flusher that drives it, and the sender stack (retry over failover over
//! per-endpoint TCP). `emit` serializes the record and appends it; all
//! network work, including retries, happens on the flush path so emitters
//! never wait on the upstream.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::buffer::backup::FileBackup;
use crate::buffer::Buffer;
use crate::config::{Endpoint, FlushMode, ForwarderConfig, RecordSerializer};
use crate::error::{ConfigError, EmitError};
use crate::event::{serialize_record, EventTime, Timestamp};
use crate::flusher::{AsyncFlusher, Flusher, SyncFlusher};
use crate::sender::{ExponentialBackOff, MultiSender, RetryableSender, Sender, TcpSender};

/// Interval at which the `wait_until_*` helpers re-check their condition.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Forwarder {
    buffer: Arc<Buffer>,
    flusher: Arc<dyn Flusher>,
    sender: Arc<dyn Sender>,
    serializer: Option<RecordSerializer>,
    closed: AtomicBool,
}

impl Forwarder {
    /// Assembles the pipeline. Spawns worker tasks, so it must be called
    /// from within a Tokio runtime.
    ///
    /// With a file-backup directory configured, chunks spilled by a previous
    /// forwarder with the same directory and prefix are reclaimed into the
    /// flush queue before any new event is accepted.
    pub fn new(config: ForwarderConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let backup = match &config.file_backup {
            Some(fb) => {
                let prefix = fb
                    .prefix
                    .clone()
                    .unwrap_or_else(|| default_backup_prefix(&config.endpoints[0]));
                Some(FileBackup::new(&fb.dir, prefix).map_err(ConfigError::Backup)?)
            }
            None => None,
        };

        let flush_signal = Arc::new(Notify::new());
        let buffer = Arc::new(
            Buffer::new(
                config.buffer.clone(),
                config.ack_response_mode,
                backup,
                flush_signal.clone(),
            )
            .map_err(ConfigError::Backup)?,
        );

        let sender = build_sender_stack(&config);
        let flusher: Arc<dyn Flusher> = match config.flush_mode {
            FlushMode::Async => Arc::new(AsyncFlusher::start(
                buffer.clone(),
                sender.clone(),
                config.flusher.clone(),
                flush_signal,
            )),
            FlushMode::Sync => Arc::new(SyncFlusher::new(
                buffer.clone(),
                sender.clone(),
                config.flusher.clone(),
            )),
        };

        debug!(endpoints = config.endpoints.len(), mode = ?config.flush_mode, "forwarder started");
        Ok(Forwarder {
            buffer,
            flusher,
            sender,
            serializer: config.record_serializer,
            closed: AtomicBool::new(false),
        })
    }

    /// Emits a record map under `tag`, stamped with the current epoch second.
    pub async fn emit(&self, tag: &str, record: &Value) -> Result<(), EmitError> {
        self.emit_serialized(tag, Timestamp::now(), record).await
    }

    /// Emits a record map with sub-second [`EventTime`] precision.
    pub async fn emit_with_time(
        &self,
        tag: &str,
        time: EventTime,
        record: &Value,
    ) -> Result<(), EmitError> {
        self.emit_serialized(tag, time.into(), record).await
    }

    /// Emits an already-MessagePack-encoded record map, stamped with the
    /// current epoch second. The bytes are appended as-is.
    pub async fn emit_msgpack(&self, tag: &str, record_map: &[u8]) -> Result<(), EmitError> {
        self.append(tag, Timestamp::now(), record_map).await
    }

    /// Emits an already-encoded record map with [`EventTime`] precision.
    pub async fn emit_msgpack_with_time(
        &self,
        tag: &str,
        time: EventTime,
        record_map: &[u8],
    ) -> Result<(), EmitError> {
        self.append(tag, time.into(), record_map).await
    }

    async fn emit_serialized(
        &self,
        tag: &str,
        ts: Timestamp,
        record: &Value,
    ) -> Result<(), EmitError> {
        let record_map = serialize_record(self.serializer.as_ref(), record)?;
        self.append(tag, ts, &record_map).await
    }

    async fn append(&self, tag: &str, ts: Timestamp, record_map: &[u8]) -> Result<(), EmitError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EmitError::Terminated);
        }
        match self.buffer.append(tag, ts, record_map) {
            Err(e) if e.is_full() => {
                // One opportunistic reclaim, then the producer decides.
                self.flusher.on_buffer_full().await;
                self.buffer.append(tag, ts, record_map)?;
            }
            other => other?,
        }
        self.flusher.on_event_appended().await;
        Ok(())
    }

    /// Requests a non-forced flush of everything currently sealed.
    pub async fn flush(&self) {
        self.flusher.request_flush().await;
    }

    /// Drains within the configured bounds and shuts the pipeline down.
    /// Unsent chunks are spilled to the backup directory when one is
    /// configured. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing forwarder");
        self.flusher.close().await;
        self.buffer.close(self.sender.as_ref()).await;
        self.sender.close().await;
        debug!("forwarder closed");
    }

    /// Polls until no buffered bytes remain. Returns whether the buffer
    /// emptied within `timeout`.
    pub async fn wait_until_all_buffer_flushed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.buffer.allocated_bytes() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Polls until the flusher has terminated. Returns whether it did so
    /// within `timeout`.
    pub async fn wait_until_flusher_terminated(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.flusher.is_terminated() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.flusher.is_terminated()
    }

    /// Total bytes charged against the buffer budget.
    pub fn buffered_data_size(&self) -> usize {
        self.buffer.allocated_bytes()
    }

    /// Chunks currently open or awaiting flush.
    pub fn buffered_chunks(&self) -> usize {
        self.buffer.buffered_chunks()
    }

    /// Removes this forwarder's spill files, if a backup directory is
    /// configured.
    pub fn clear_backup_files(&self) -> io::Result<()> {
        self.buffer.clear_backup_files()
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("buffer", &self.buffer)
            .field("sender", &self.sender)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

fn build_sender_stack(config: &ForwarderConfig) -> Arc<dyn Sender> {
    let base: Arc<dyn Sender> = if config.endpoints.len() == 1 {
        Arc::new(TcpSender::new(
            config.endpoints[0].clone(),
            config.sender.clone(),
        ))
    } else {
        let children = config
            .endpoints
            .iter()
            .map(|endpoint| {
                Arc::new(TcpSender::with_failure_detection(
                    endpoint.clone(),
                    config.sender.clone(),
                    &config.heartbeat,
                )) as Arc<dyn Sender>
            })
            .collect();
        Arc::new(MultiSender::new(children))
    };
    Arc::new(RetryableSender::new(
        base,
        ExponentialBackOff::new(&config.retry),
        config.error_handler.clone(),
    ))
}

/// `<host>_<port>` with filename-hostile characters flattened, so two
/// forwarders pointed at different upstreams never steal each other's spill.
fn default_backup_prefix(endpoint: &Endpoint) -> String {
    let host: String = endpoint
        .host
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    format!("{}_{}", host, endpoint.port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferConfig, FileBackupConfig, FlusherConfig};
    use serde_json::json;

    fn unroutable_config() -> ForwarderConfig {
        // Port 1 on localhost: connections fail fast, nothing listens.
        let mut config = ForwarderConfig::single("127.0.0.1", 1);
        config.retry.max_retry_count = 0;
        config.retry.base_interval = Duration::from_millis(1);
        config.flusher = FlusherConfig {
            flush_interval: Duration::from_millis(20),
            wait_until_buffer_flushed: Duration::from_millis(200),
            wait_until_terminated: Duration::from_millis(500),
        };
        config.sender.wait_before_close = Duration::from_millis(10);
        config
    }

    #[test]
    fn backup_prefix_is_filename_safe() {
        assert_eq!(
            default_backup_prefix(&Endpoint::new("fluentd.example.com", 24224)),
            "fluentd-example-com_24224"
        );
        assert_eq!(
            default_backup_prefix(&Endpoint::new("::1", 24224)),
            "--1_24224"
        );
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let config = ForwarderConfig::default();
        assert!(matches!(
            Forwarder::new(config),
            Err(ConfigError::NoEndpoints)
        ));
    }

    #[tokio::test]
    async fn emit_rejects_non_map_records() {
        let forwarder = Forwarder::new(unroutable_config()).unwrap();
        let err = forwarder.emit("t", &json!("just a string")).await.unwrap_err();
        assert!(matches!(err, EmitError::RecordNotAMap));
        forwarder.close().await;
    }

    #[tokio::test]
    async fn emit_after_close_is_terminated() {
        let forwarder = Forwarder::new(unroutable_config()).unwrap();
        forwarder.close().await;
        assert!(forwarder.is_terminated());
        let err = forwarder.emit("t", &json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, EmitError::Terminated));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let forwarder = Forwarder::new(unroutable_config()).unwrap();
        forwarder.emit("t", &json!({"a": 1})).await.unwrap();
        forwarder.close().await;
        forwarder.close().await;
        assert!(forwarder.is_terminated());
    }

    #[tokio::test]
    async fn counters_track_buffered_state() {
        let forwarder = Forwarder::new(unroutable_config()).unwrap();
        assert_eq!(forwarder.buffered_data_size(), 0);
        assert_eq!(forwarder.buffered_chunks(), 0);

        forwarder.emit("t", &json!({"a": 1})).await.unwrap();
        assert!(forwarder.buffered_data_size() > 0);
        assert_eq!(forwarder.buffered_chunks(), 1);
        forwarder.close().await;
    }

    #[tokio::test]
    async fn unreachable_upstream_spills_to_backup_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = unroutable_config();
        config.buffer = BufferConfig {
            chunk_retention_time: Duration::from_millis(10),
            ..Default::default()
        };
        config.file_backup = Some(FileBackupConfig::new(dir.path()));

        let forwarder = Forwarder::new(config).unwrap();
        forwarder.emit("t", &json!({"a": 1})).await.unwrap();
        forwarder.close().await;
        assert_eq!(forwarder.buffered_data_size(), 0);

        let spilled: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(spilled.len(), 1);

        // A fresh forwarder with the same directory reclaims the chunk.
        let mut config = unroutable_config();
        config.file_backup = Some(FileBackupConfig::new(dir.path()));
        let revived = Forwarder::new(config).unwrap();
        assert_eq!(revived.buffered_chunks(), 1);
        assert!(revived.buffered_data_size() > 0);

        revived.clear_backup_files().unwrap();
        revived.close().await;
    }

    #[tokio::test]
    async fn wait_helpers_time_out_against_a_dead_upstream() {
        let forwarder = Forwarder::new(unroutable_config()).unwrap();
        forwarder.emit("t", &json!({"a": 1})).await.unwrap();

        assert!(!forwarder
            .wait_until_all_buffer_flushed(Duration::from_millis(150))
            .await);
        assert!(!forwarder
            .wait_until_flusher_terminated(Duration::from_millis(50))
            .await);

        forwarder.close().await;
        assert!(forwarder
            .wait_until_flusher_terminated(Duration::from_secs(2))
            .await);
    }
}
