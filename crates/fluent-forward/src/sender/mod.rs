//! The sender capability contract and its implementations.
//!
//! A sender owns delivery of framed Forward requests. [`TcpSender`] drives a
//! single connection; [`MultiSender`] fails over across several of them.
//! [`RetryableSender`] adds the backoff schedule on top of either.

pub(crate) mod failure_detector;
pub(crate) mod heartbeat;
mod multi;
mod retry;
mod tcp;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::SendError;

pub use multi::MultiSender;
pub use retry::{ExponentialBackOff, RetryableSender};
pub use tcp::TcpSender;

/// Capability contract of the sender stack.
///
/// `send` ships framed segments; `send_with_ack` additionally reads and
/// verifies the upstream's ack echo against `ack_token`. Implementations
/// must serialize writes so concurrent flushers cannot interleave frames.
#[async_trait]
pub trait Sender: Send + Sync + fmt::Debug {
    async fn send(&self, segments: Vec<Bytes>) -> Result<(), SendError>;

    async fn send_with_ack(&self, segments: Vec<Bytes>, ack_token: &str) -> Result<(), SendError>;

    /// Whether this sender is currently worth attempting. Gated by the
    /// failure detector where one is attached; `true` otherwise.
    fn is_available(&self) -> bool;

    async fn close(&self);
}
