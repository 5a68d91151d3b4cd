//! Round-robin failover across child senders.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::SendError;
use crate::sender::Sender;

/// Tries children in round-robin order starting from the last child that
/// succeeded, skipping any whose failure detector reports unavailable. The
/// first success wins; if every child is unavailable or fails, the last
/// error surfaces.
#[derive(Debug)]
pub struct MultiSender {
    children: Vec<Arc<dyn Sender>>,
    preferred: AtomicUsize,
}

impl MultiSender {
    pub fn new(children: Vec<Arc<dyn Sender>>) -> Self {
        MultiSender {
            children,
            preferred: AtomicUsize::new(0),
        }
    }

    async fn dispatch(&self, segments: Vec<Bytes>, ack_token: Option<&str>) -> Result<(), SendError> {
        let start = self.preferred.load(Ordering::Relaxed);
        let mut last_err = None;

        for offset in 0..self.children.len() {
            let index = (start + offset) % self.children.len();
            let child = &self.children[index];
            if !child.is_available() {
                continue;
            }

            let result = match ack_token {
                Some(token) => child.send_with_ack(segments.clone(), token).await,
                None => child.send(segments.clone()).await,
            };
            match result {
                Ok(()) => {
                    self.preferred.store(index, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) => {
                    debug!(child = index, error = %e, "child sender failed, trying next");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(SendError::NoAvailableEndpoint))
    }
}

#[async_trait]
impl Sender for MultiSender {
    async fn send(&self, segments: Vec<Bytes>) -> Result<(), SendError> {
        self.dispatch(segments, None).await
    }

    async fn send_with_ack(&self, segments: Vec<Bytes>, ack_token: &str) -> Result<(), SendError> {
        self.dispatch(segments, Some(ack_token)).await
    }

    fn is_available(&self) -> bool {
        self.children.iter().any(|child| child.is_available())
    }

    async fn close(&self) {
        for child in &self.children {
            child.close().await;
        }
    }
}
