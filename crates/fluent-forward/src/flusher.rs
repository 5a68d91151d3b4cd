//! Drives the buffer toward the sender.
//!
//! Two strategies behind one contract: the periodic flusher runs a dedicated
//! worker that wakes on its interval or on a flush request, while the sync
//! flusher piggybacks on the emitting caller and flushes inline once the
//! interval has elapsed. Both drain with bounded patience on close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::config::FlusherConfig;
use crate::sender::Sender;

/// Pause between forced flush attempts while draining a failing sender.
const DRAIN_RETRY_PAUSE: Duration = Duration::from_millis(100);

#[async_trait]
pub(crate) trait Flusher: Send + Sync {
    /// Called after every successful append.
    async fn on_event_appended(&self);

    /// Requests a non-forced flush as soon as possible.
    async fn request_flush(&self);

    /// Called when an append bounced off the budget, before the producer's
    /// single retry.
    async fn on_buffer_full(&self);

    /// Drains the buffer within the configured bounds and stops any worker.
    async fn close(&self);

    /// Monotonic: false until `close` has completed worker shutdown.
    fn is_terminated(&self) -> bool;
}

/// Force-flushes until the buffer is empty or the deadline passes.
async fn drain(buffer: &Buffer, sender: &dyn Sender, wait: Duration) {
    let deadline = Instant::now() + wait;
    while buffer.has_pending() {
        if let Err(e) = buffer.flush(sender, true).await {
            warn!(error = %e, "drain flush failed");
            tokio::time::sleep(DRAIN_RETRY_PAUSE).await;
        }
        if Instant::now() >= deadline {
            warn!(
                chunks = buffer.buffered_chunks(),
                "gave up draining before the deadline"
            );
            break;
        }
    }
}

/// The periodic flusher: one worker task, woken by interval or request.
pub(crate) struct AsyncFlusher {
    flush_signal: Arc<Notify>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    terminated: Arc<AtomicBool>,
    wait_until_terminated: Duration,
}

impl AsyncFlusher {
    /// Spawns the worker; must be called from within a Tokio runtime.
    pub fn start(
        buffer: Arc<Buffer>,
        sender: Arc<dyn Sender>,
        config: FlusherConfig,
        flush_signal: Arc<Notify>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let terminated = Arc::new(AtomicBool::new(false));

        let worker = tokio::spawn(worker_loop(
            buffer,
            sender,
            config.clone(),
            flush_signal.clone(),
            cancel.clone(),
            terminated.clone(),
        ));

        AsyncFlusher {
            flush_signal,
            cancel,
            worker: Mutex::new(Some(worker)),
            terminated,
            wait_until_terminated: config.wait_until_terminated,
        }
    }
}

async fn worker_loop(
    buffer: Arc<Buffer>,
    sender: Arc<dyn Sender>,
    config: FlusherConfig,
    flush_signal: Arc<Notify>,
    cancel: CancellationToken,
    terminated: Arc<AtomicBool>,
) {
    debug!("flush worker started");
    let mut tick = tokio::time::interval(config.flush_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = flush_signal.notified() => {}
            _ = cancel.cancelled() => break,
        }
        if let Err(e) = buffer.flush(sender.as_ref(), false).await {
            debug!(error = %e, "flush failed, chunks retained");
        }
    }

    drain(&buffer, sender.as_ref(), config.wait_until_buffer_flushed).await;
    terminated.store(true, Ordering::SeqCst);
    debug!("flush worker stopped");
}

#[async_trait]
impl Flusher for AsyncFlusher {
    async fn on_event_appended(&self) {}

    async fn request_flush(&self) {
        self.flush_signal.notify_one();
    }

    async fn on_buffer_full(&self) {
        // The buffer already raised the flush signal; the producer's retry
        // happens on its own schedule.
    }

    async fn close(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().expect("lock poisoned").take();
        if let Some(worker) = worker {
            if tokio::time::timeout(self.wait_until_terminated, worker)
                .await
                .is_err()
            {
                warn!("flush worker did not stop in time");
            }
        }
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// The caller-driven flusher: no worker, flushing happens inline on emit
/// once the interval deadline elapses.
pub(crate) struct SyncFlusher {
    buffer: Arc<Buffer>,
    sender: Arc<dyn Sender>,
    config: FlusherConfig,
    last_flush: Mutex<Instant>,
    terminated: AtomicBool,
}

impl SyncFlusher {
    pub fn new(buffer: Arc<Buffer>, sender: Arc<dyn Sender>, config: FlusherConfig) -> Self {
        SyncFlusher {
            buffer,
            sender,
            config,
            last_flush: Mutex::new(Instant::now()),
            terminated: AtomicBool::new(false),
        }
    }

    async fn flush_now(&self, force: bool) {
        *self.last_flush.lock().expect("lock poisoned") = Instant::now();
        if let Err(e) = self.buffer.flush(self.sender.as_ref(), force).await {
            debug!(error = %e, "inline flush failed, chunks retained");
        }
    }
}

#[async_trait]
impl Flusher for SyncFlusher {
    async fn on_event_appended(&self) {
        let due = {
            let last = self.last_flush.lock().expect("lock poisoned");
            last.elapsed() >= self.config.flush_interval
        };
        if due {
            self.flush_now(false).await;
        }
    }

    async fn request_flush(&self) {
        self.flush_now(false).await;
    }

    async fn on_buffer_full(&self) {
        // Inline reclaim attempt so the producer's single retry can land.
        self.flush_now(true).await;
    }

    async fn close(&self) {
        drain(
            &self.buffer,
            self.sender.as_ref(),
            self.config.wait_until_buffer_flushed,
        )
        .await;
        self.terminated.store(true, Ordering::SeqCst);
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}
