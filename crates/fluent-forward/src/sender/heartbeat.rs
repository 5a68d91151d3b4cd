//! Liveness probes feeding the failure detector.
//!
//! A heartbeater runs on its own task until cancelled by the owning sender.
//! The TCP probe counts a successful connect as an arrival; the UDP probe
//! fires a datagram and counts the tick itself, since UDP gives no
//! confirmation either way.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::{HeartbeatConfig, HeartbeatTransport};
use crate::sender::failure_detector::PhiAccrualFailureDetector;

#[derive(Debug)]
pub(crate) struct Heartbeater {
    cancel: CancellationToken,
}

impl Heartbeater {
    pub fn start(
        host: String,
        port: u16,
        config: &HeartbeatConfig,
        detector: Arc<PhiAccrualFailureDetector>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let transport = config.transport;
        let interval = config.interval;
        tokio::spawn(async move {
            probe_loop(host, port, transport, interval, detector, token).await;
        });
        Heartbeater { cancel }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Heartbeater {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn probe_loop(
    host: String,
    port: u16,
    transport: HeartbeatTransport,
    interval: Duration,
    detector: Arc<PhiAccrualFailureDetector>,
    cancel: CancellationToken,
) {
    let addr = format!("{host}:{port}");
    debug!(%addr, ?transport, "heartbeat started");
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = cancel.cancelled() => break,
        }
        match transport {
            HeartbeatTransport::Tcp => {
                match tokio::time::timeout(interval, TcpStream::connect(&addr)).await {
                    Ok(Ok(_stream)) => {
                        trace!(%addr, "heartbeat pong");
                        detector.heartbeat();
                    }
                    Ok(Err(e)) => trace!(%addr, error = %e, "heartbeat connect failed"),
                    Err(_) => trace!(%addr, "heartbeat connect timed out"),
                }
            }
            HeartbeatTransport::Udp => {
                // Fire-and-forget; the tick counts as the arrival.
                match UdpSocket::bind("0.0.0.0:0").await {
                    Ok(socket) => {
                        let _ = socket.send_to(&[0u8], &addr).await;
                        detector.heartbeat();
                    }
                    Err(e) => trace!(%addr, error = %e, "heartbeat socket unavailable"),
                }
            }
        }
    }
    debug!(%addr, "heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast_config(transport: HeartbeatTransport) -> HeartbeatConfig {
        HeartbeatConfig {
            transport,
            interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn tcp_probe_records_arrivals_while_listener_is_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let detector = Arc::new(PhiAccrualFailureDetector::new(
            16.0,
            Duration::from_millis(3000),
        ));
        let hb = Heartbeater::start(
            "127.0.0.1".into(),
            port,
            &fast_config(HeartbeatTransport::Tcp),
            detector.clone(),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        hb.shutdown();
        assert!(detector.is_available());
    }

    #[tokio::test]
    async fn udp_probe_is_failure_silent() {
        // Nothing listens on the target port; the probe must still tick.
        let detector = Arc::new(PhiAccrualFailureDetector::new(
            16.0,
            Duration::from_millis(3000),
        ));
        let hb = Heartbeater::start(
            "127.0.0.1".into(),
            1,
            &fast_config(HeartbeatTransport::Udp),
            detector.clone(),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        hb.shutdown();
        assert!(detector.is_available());
    }
}
