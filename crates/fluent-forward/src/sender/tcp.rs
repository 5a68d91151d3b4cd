//! The single-connection TCP sender.
//!
//! The connection is opened lazily on first send and owned behind one async
//! mutex, which doubles as the send-mutex: holders write their frames
//! without interleaving, and in ack mode read the response on the same
//! connection before releasing it. Any I/O failure closes the socket,
//! notifies the failure detector, and surfaces to the retry layer above.

use std::io::IoSlice;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use crate::config::{Endpoint, HeartbeatConfig, SenderConfig};
use crate::error::SendError;
use crate::protocol::{AckResponse, ACK_RESPONSE_LIMIT};
use crate::sender::failure_detector::PhiAccrualFailureDetector;
use crate::sender::heartbeat::Heartbeater;
use crate::sender::Sender;

#[derive(Debug)]
pub struct TcpSender {
    endpoint: Endpoint,
    config: SenderConfig,
    conn: tokio::sync::Mutex<Option<TcpStream>>,
    failure_detector: Option<Arc<PhiAccrualFailureDetector>>,
    heartbeater: Option<Heartbeater>,
}

impl TcpSender {
    pub fn new(endpoint: Endpoint, config: SenderConfig) -> Self {
        TcpSender {
            endpoint,
            config,
            conn: tokio::sync::Mutex::new(None),
            failure_detector: None,
            heartbeater: None,
        }
    }

    /// A sender whose availability is gated by a heartbeat-fed φ-accrual
    /// detector. Used for failover members. Must be called from within a
    /// Tokio runtime.
    pub fn with_failure_detection(
        endpoint: Endpoint,
        config: SenderConfig,
        heartbeat: &HeartbeatConfig,
    ) -> Self {
        let detector = Arc::new(PhiAccrualFailureDetector::new(
            heartbeat.phi_threshold,
            heartbeat.failure_interval,
        ));
        let heartbeater = Heartbeater::start(
            endpoint.host.clone(),
            endpoint.port,
            heartbeat,
            detector.clone(),
        );
        TcpSender {
            endpoint,
            config,
            conn: tokio::sync::Mutex::new(None),
            failure_detector: Some(detector),
            heartbeater: Some(heartbeater),
        }
    }

    async fn get_or_connect<'a>(
        &self,
        conn: &'a mut Option<TcpStream>,
    ) -> Result<&'a mut TcpStream, SendError> {
        if conn.is_none() {
            let addr = self.endpoint.addr();
            let stream = timeout(self.config.connection_timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| SendError::ConnectTimeout {
                    addr: addr.clone(),
                    timeout: self.config.connection_timeout,
                })?
                .map_err(|e| SendError::Io {
                    addr: addr.clone(),
                    source: e,
                })?;
            stream.set_nodelay(true).map_err(|e| SendError::Io {
                addr: addr.clone(),
                source: e,
            })?;
            debug!(%addr, "connected");
            *conn = Some(stream);
        }
        Ok(conn.as_mut().expect("connection present"))
    }

    async fn write_segments(
        &self,
        stream: &mut TcpStream,
        segments: &[Bytes],
    ) -> Result<(), SendError> {
        let total: usize = segments.iter().map(Bytes::len).sum();
        trace!(addr = %self.endpoint.addr(), bytes = total, "writing frame");

        let mut slices: Vec<IoSlice<'_>> = segments.iter().map(|s| IoSlice::new(s)).collect();
        let mut written = 0usize;
        while written < total {
            let n = stream
                .write_vectored(&slices)
                .await
                .map_err(|e| self.io_error(e))?;
            if n == 0 {
                return Err(self.io_error(std::io::ErrorKind::WriteZero.into()));
            }
            written += n;
            if written < total {
                slices = remaining_slices(segments, written);
            }
        }
        stream.flush().await.map_err(|e| self.io_error(e))?;
        Ok(())
    }

    /// Reads at most [`ACK_RESPONSE_LIMIT`] bytes until a complete ack map
    /// decodes, the deadline passes, or the peer closes.
    async fn read_ack(&self, stream: &mut TcpStream, expected: &str) -> Result<(), SendError> {
        let deadline = Instant::now() + self.config.read_timeout;
        let mut buf = [0u8; ACK_RESPONSE_LIMIT];
        let mut filled = 0usize;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SendError::AckTimeout(self.config.read_timeout));
            }
            let n = timeout(remaining, stream.read(&mut buf[filled..]))
                .await
                .map_err(|_| SendError::AckTimeout(self.config.read_timeout))?
                .map_err(|e| self.io_error(e))?;
            if n == 0 {
                return Err(SendError::AckDecode("connection closed mid-response".into()));
            }
            filled += n;

            match rmp_serde::from_slice::<AckResponse>(&buf[..filled]) {
                Ok(response) => {
                    if response.ack != expected {
                        return Err(SendError::AckMismatch {
                            expected: expected.to_owned(),
                            got: response.ack,
                        });
                    }
                    return Ok(());
                }
                Err(e) if filled == buf.len() => {
                    return Err(SendError::AckDecode(e.to_string()));
                }
                // Assume a short read and keep accumulating until the
                // deadline decides otherwise.
                Err(_) => {}
            }
        }
    }

    async fn dispatch(
        &self,
        segments: Vec<Bytes>,
        ack_token: Option<&str>,
    ) -> Result<(), SendError> {
        let mut conn = self.conn.lock().await;
        let result = async {
            let stream = self.get_or_connect(&mut conn).await?;
            self.write_segments(stream, &segments).await?;
            if let Some(token) = ack_token {
                self.read_ack(stream, token).await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = &result {
            debug!(addr = %self.endpoint.addr(), error = %e, "send failed, closing connection");
            *conn = None;
            if let Some(detector) = &self.failure_detector {
                detector.on_failure();
            }
        }
        result
    }

    fn io_error(&self, e: std::io::Error) -> SendError {
        SendError::Io {
            addr: self.endpoint.addr(),
            source: e,
        }
    }
}

fn remaining_slices(segments: &[Bytes], mut skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(segments.len());
    for segment in segments {
        if skip >= segment.len() {
            skip -= segment.len();
            continue;
        }
        slices.push(IoSlice::new(&segment[skip..]));
        skip = 0;
    }
    slices
}

#[async_trait]
impl Sender for TcpSender {
    async fn send(&self, segments: Vec<Bytes>) -> Result<(), SendError> {
        self.dispatch(segments, None).await
    }

    async fn send_with_ack(&self, segments: Vec<Bytes>, ack_token: &str) -> Result<(), SendError> {
        self.dispatch(segments, Some(ack_token)).await
    }

    fn is_available(&self) -> bool {
        self.failure_detector
            .as_ref()
            .map_or(true, |d| d.is_available())
    }

    async fn close(&self) {
        let mut conn = self.conn.lock().await;
        if conn.is_some() {
            // Give an in-flight ack a chance to land before tearing down.
            tokio::time::sleep(self.config.wait_before_close).await;
            *conn = None;
        }
        if let Some(heartbeater) = &self.heartbeater {
            heartbeater.shutdown();
        }
        debug!(addr = %self.endpoint.addr(), "sender closed");
    }
}
