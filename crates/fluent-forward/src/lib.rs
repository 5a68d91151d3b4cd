//! A buffering client for the Fluentd Forward protocol.
//!
//! Producers hand records to [`Forwarder::emit`]; the forwarder serializes
//! them to MessagePack, coalesces them into per-tag chunks under a global
//! memory budget, and ships sealed chunks as PackedForward requests over
//! TCP, periodically as well as on demand and on close. Delivery is hardened with
//! exponential-backoff retries, round-robin failover across endpoints gated
//! by a φ-accrual failure detector, optional per-chunk acknowledgements,
//! and file-backed spill for whatever cannot be delivered before shutdown.
//!
//! ```no_run
//! use fluent_forward::{Forwarder, ForwarderConfig};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let forwarder = Forwarder::new(ForwarderConfig::single("127.0.0.1", 24224))?;
//! forwarder.emit("app.access", &json!({"method": "GET", "status": 200})).await?;
//! forwarder.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! Ordering is preserved per tag against a single endpoint; it is not
//! preserved across failover. Delivery is at-least-once in ack mode and
//! best-effort otherwise.

pub(crate) mod buffer;
pub mod config;
pub mod error;
pub mod event;
pub(crate) mod flusher;
mod forwarder;
pub(crate) mod protocol;
pub mod sender;

#[cfg(test)]
pub(crate) mod test_util;

pub use config::{
    BufferConfig, Endpoint, ErrorHandler, FileBackupConfig, FlushMode, FlusherConfig,
    ForwarderConfig, HeartbeatConfig, HeartbeatTransport, RecordSerializer, RetryConfig,
    SenderConfig,
};
pub use error::{BufferError, ConfigError, EmitError, SendError};
pub use event::{EventTime, Timestamp};
pub use forwarder::Forwarder;
pub use sender::{ExponentialBackOff, MultiSender, RetryableSender, Sender, TcpSender};
