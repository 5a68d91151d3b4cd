//! Shared stubs for unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::SendError;
use crate::sender::Sender;

/// In-memory sender recording every accepted request; can be switched into
/// a failing or forever-blocking mode.
#[derive(Debug, Default)]
pub(crate) struct RecordingSender {
    requests: Mutex<Vec<Vec<Bytes>>>,
    fail: AtomicBool,
    block: AtomicBool,
}

impl RecordingSender {
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Makes every send park forever, simulating a wedged upstream.
    pub fn set_block(&self, block: bool) {
        self.block.store(block, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<Vec<Bytes>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sender for RecordingSender {
    async fn send(&self, segments: Vec<Bytes>) -> Result<(), SendError> {
        if self.block.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(SendError::NoAvailableEndpoint);
        }
        self.requests.lock().unwrap().push(segments);
        Ok(())
    }

    async fn send_with_ack(&self, segments: Vec<Bytes>, _ack_token: &str) -> Result<(), SendError> {
        self.send(segments).await
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn close(&self) {}
}
