//! Retrying sender wrapper and its backoff schedule.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, error};

use crate::config::{ErrorHandler, RetryConfig};
use crate::error::SendError;
use crate::sender::Sender;

/// `min(base * 2^attempt, max)` with a bounded number of attempts.
#[derive(Debug, Clone)]
pub struct ExponentialBackOff {
    base_interval: Duration,
    max_interval: Duration,
    max_retry_count: u32,
}

impl ExponentialBackOff {
    pub fn new(config: &RetryConfig) -> Self {
        ExponentialBackOff {
            base_interval: config.base_interval,
            max_interval: config.max_interval,
            max_retry_count: config.max_retry_count,
        }
    }

    pub fn next_interval(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_interval
            .saturating_mul(factor)
            .min(self.max_interval)
    }

    pub fn is_retry_over(&self, attempt: u32) -> bool {
        attempt >= self.max_retry_count
    }
}

/// Wraps any sender with the backoff schedule. When the schedule is
/// exhausted a terminal [`SendError::RetryOver`] carrying the final failure
/// is returned to the caller and handed to the error callback, if any.
pub struct RetryableSender {
    inner: Arc<dyn Sender>,
    backoff: ExponentialBackOff,
    error_handler: Option<ErrorHandler>,
}

impl RetryableSender {
    pub fn new(
        inner: Arc<dyn Sender>,
        backoff: ExponentialBackOff,
        error_handler: Option<ErrorHandler>,
    ) -> Self {
        RetryableSender {
            inner,
            backoff,
            error_handler,
        }
    }

    async fn dispatch(&self, segments: Vec<Bytes>, ack_token: Option<&str>) -> Result<(), SendError> {
        let mut attempt = 0u32;
        loop {
            let result = match ack_token {
                Some(token) => self.inner.send_with_ack(segments.clone(), token).await,
                None => self.inner.send(segments.clone()).await,
            };
            let Err(e) = result else {
                return Ok(());
            };

            if self.backoff.is_retry_over(attempt) {
                let terminal = SendError::RetryOver {
                    attempts: attempt + 1,
                    source: Box::new(e),
                };
                error!(error = %terminal, "giving up on send");
                if let Some(handler) = &self.error_handler {
                    handler(&terminal);
                }
                return Err(terminal);
            }

            let pause = self.backoff.next_interval(attempt);
            debug!(attempt, error = %e, pause_ms = pause.as_millis() as u64, "send failed, backing off");
            tokio::time::sleep(pause).await;
            attempt += 1;
        }
    }
}

impl std::fmt::Debug for RetryableSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryableSender")
            .field("inner", &self.inner)
            .field("backoff", &self.backoff)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

#[async_trait]
impl Sender for RetryableSender {
    async fn send(&self, segments: Vec<Bytes>) -> Result<(), SendError> {
        self.dispatch(segments, None).await
    }

    async fn send_with_ack(&self, segments: Vec<Bytes>, ack_token: &str) -> Result<(), SendError> {
        self.dispatch(segments, Some(ack_token)).await
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
