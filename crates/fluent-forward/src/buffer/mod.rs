//! The per-tag chunk buffer: the stage between `emit` and the sender.
//!
//! Appenders coalesce encoded events into one current chunk per tag; sealed
//! chunks queue up FIFO until a flush hands them to the sender. A single
//! atomic counter tracks the logical capacity of every outstanding chunk and
//! enforces the global budget: an append that cannot be charged signals the
//! flusher once and fails with [`BufferError::Full`].
//!
//! Locking is deliberately layered: the tag map lock is held only to fetch a
//! tag's slot, each slot has its own lock so distinct tags append in
//! parallel, and a consumer-side async lock serializes drains so chunk order
//! on the wire stays FIFO.

pub(crate) mod backup;
pub(crate) mod chunk;

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, error, trace, warn};

use crate::config::BufferConfig;
use crate::error::{BufferError, SendError};
use crate::event::Timestamp;
use crate::protocol;
use crate::sender::Sender;

use backup::FileBackup;
use chunk::Chunk;

type TagSlot = Arc<Mutex<Option<Chunk>>>;

pub(crate) struct Buffer {
    config: BufferConfig,
    ack_response_mode: bool,
    current: Mutex<HashMap<String, TagSlot>>,
    sealed: Mutex<VecDeque<Chunk>>,
    allocated: AtomicUsize,
    /// Wakes the flush worker; poked when the budget is exhausted.
    flush_signal: Arc<Notify>,
    drain_lock: tokio::sync::Mutex<()>,
    backup: Option<FileBackup>,
}

impl Buffer {
    pub fn new(
        config: BufferConfig,
        ack_response_mode: bool,
        backup: Option<FileBackup>,
        flush_signal: Arc<Notify>,
    ) -> io::Result<Self> {
        let buffer = Buffer {
            config,
            ack_response_mode,
            current: Mutex::new(HashMap::new()),
            sealed: Mutex::new(VecDeque::new()),
            allocated: AtomicUsize::new(0),
            flush_signal,
            drain_lock: tokio::sync::Mutex::new(()),
            backup,
        };

        if let Some(backup) = &buffer.backup {
            let restored = backup.load()?;
            if !restored.is_empty() {
                debug!(chunks = restored.len(), "rehydrated spilled chunks");
            }
            let mut sealed = buffer.sealed.lock().expect("lock poisoned");
            for chunk in restored {
                buffer.allocated.fetch_add(chunk.capacity(), Ordering::Relaxed);
                sealed.push_back(chunk);
            }
        }
        Ok(buffer)
    }

    /// Encodes one event and appends it to the tag's current chunk, creating
    /// or growing the chunk as needed within the global budget.
    pub fn append(
        &self,
        tag: &str,
        ts: Timestamp,
        record_map: &[u8],
    ) -> Result<(), BufferError> {
        if tag.is_empty() {
            return Err(BufferError::InvalidTag(tag.to_owned()));
        }

        let mut entry = Vec::with_capacity(record_map.len() + 16);
        protocol::encode_entry(&mut entry, ts, record_map).map_err(BufferError::Encode)?;

        let slot = self.tag_slot(tag);
        let mut guard = slot.lock().expect("lock poisoned");

        self.ensure_room(tag, &mut guard, entry.len())?;
        let chunk = guard.as_mut().expect("chunk present after ensure_room");
        chunk.push_entry(&entry);
        trace!(%tag, bytes = entry.len(), size = chunk.len(), "appended event");

        if chunk.len() >= self.config.chunk_retention_size
            || chunk.age() >= self.config.chunk_retention_time
        {
            if let Some(full) = guard.take() {
                self.enqueue_sealed(full);
            }
        }
        Ok(())
    }

    fn tag_slot(&self, tag: &str) -> TagSlot {
        let mut map = self.current.lock().expect("lock poisoned");
        map.entry(tag.to_owned()).or_default().clone()
    }

    /// Makes sure the slot holds a chunk with room for `needed` bytes,
    /// charging any capacity increase against the budget.
    fn ensure_room(
        &self,
        tag: &str,
        slot: &mut Option<Chunk>,
        needed: usize,
    ) -> Result<(), BufferError> {
        match slot {
            None => {
                let capacity = self.config.chunk_initial_size.max(needed);
                self.charge(capacity)?;
                *slot = Some(Chunk::new(tag, capacity));
            }
            Some(chunk) if chunk.remaining() < needed => {
                let mut capacity = chunk.capacity();
                while capacity < self.config.chunk_retention_size
                    && capacity - chunk.len() < needed
                {
                    let grown = (capacity as f64 * self.config.chunk_expand_ratio).ceil() as usize;
                    capacity = grown.min(self.config.chunk_retention_size);
                }

                if capacity - chunk.len() >= needed {
                    self.charge(capacity - chunk.capacity())?;
                    chunk.grow_to(capacity);
                } else {
                    // Even a fully grown chunk cannot take this event: seal
                    // it and start a fresh one sized to fit.
                    let fresh_capacity = self.config.chunk_initial_size.max(needed);
                    self.charge(fresh_capacity)?;
                    if let Some(full) = slot.take() {
                        self.enqueue_sealed(full);
                    }
                    *slot = Some(Chunk::new(tag, fresh_capacity));
                }
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn charge(&self, delta: usize) -> Result<(), BufferError> {
        let limit = self.config.max_buffer_size;
        let charged = self
            .allocated
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_add(delta).filter(|total| *total <= limit)
            });
        match charged {
            Ok(_) => Ok(()),
            Err(current) => {
                // One opportunistic flush attempt: wake the worker, then let
                // the producer decide whether to retry.
                self.flush_signal.notify_one();
                Err(BufferError::Full {
                    needed: delta,
                    allocated: current,
                    limit,
                })
            }
        }
    }

    fn enqueue_sealed(&self, chunk: Chunk) {
        trace!(tag = chunk.tag(), bytes = chunk.len(), events = chunk.events(), "sealed chunk");
        self.sealed.lock().expect("lock poisoned").push_back(chunk);
    }

    /// Seals retention-expired (or, when forced, all) current chunks and
    /// hands every sealed chunk to the sender in FIFO order.
    ///
    /// Stops at the first send failure; the failed chunk goes back to the
    /// head of the queue untouched.
    pub async fn flush(&self, sender: &dyn Sender, force: bool) -> Result<(), SendError> {
        self.seal_expired(force);

        let _drain = self.drain_lock.lock().await;
        loop {
            let chunk = {
                let mut sealed = self.sealed.lock().expect("lock poisoned");
                sealed.pop_front()
            };
            let Some(chunk) = chunk else {
                return Ok(());
            };

            match self.ship(sender, &chunk).await {
                Ok(()) => {
                    self.allocated.fetch_sub(chunk.capacity(), Ordering::SeqCst);
                    trace!(
                        tag = chunk.tag(),
                        bytes = chunk.len(),
                        events = chunk.events(),
                        "chunk delivered"
                    );
                }
                Err(e) => {
                    self.sealed.lock().expect("lock poisoned").push_front(chunk);
                    return Err(e);
                }
            }
        }
    }

    async fn ship(&self, sender: &dyn Sender, chunk: &Chunk) -> Result<(), SendError> {
        let chunk_id = self.ack_response_mode.then(|| chunk.chunk_id());
        let request =
            protocol::build_request(chunk.tag(), chunk.payload(), chunk.events(), chunk_id)
                .map_err(SendError::Framing)?;
        match request.ack_token.as_deref() {
            Some(token) => sender.send_with_ack(request.segments, token).await,
            None => sender.send(request.segments).await,
        }
    }

    fn seal_expired(&self, force: bool) {
        let slots: Vec<TagSlot> = {
            let map = self.current.lock().expect("lock poisoned");
            map.values().cloned().collect()
        };
        for slot in slots {
            let mut guard = slot.lock().expect("lock poisoned");
            let expired = guard.as_ref().is_some_and(|chunk| {
                force
                    || chunk.age() >= self.config.chunk_retention_time
                    || chunk.len() >= self.config.chunk_retention_size
            });
            if expired {
                if let Some(chunk) = guard.take() {
                    self.enqueue_sealed(chunk);
                }
            }
        }
    }

    /// Final flush, then spills (or, without a backup directory, drops)
    /// whatever the sender would not take.
    pub async fn close(&self, sender: &dyn Sender) {
        if let Err(e) = self.flush(sender, true).await {
            warn!(error = %e, "final flush failed, falling back to backup");
        }

        let leftovers: Vec<Chunk> = {
            let mut sealed = self.sealed.lock().expect("lock poisoned");
            sealed.drain(..).collect()
        };
        if leftovers.is_empty() {
            return;
        }

        match &self.backup {
            Some(backup) => {
                for chunk in leftovers {
                    self.allocated.fetch_sub(chunk.capacity(), Ordering::SeqCst);
                    if let Err(e) = backup.save(&chunk) {
                        error!(
                            tag = chunk.tag(),
                            events = chunk.events(),
                            error = %e,
                            "failed to spill chunk, events lost"
                        );
                    }
                }
            }
            None => {
                let (chunks, events) = leftovers
                    .iter()
                    .fold((0usize, 0u64), |(c, e), chunk| (c + 1, e + chunk.events()));
                for chunk in leftovers {
                    self.allocated.fetch_sub(chunk.capacity(), Ordering::SeqCst);
                }
                warn!(chunks, events, "dropping unsent chunks, no backup directory configured");
            }
        }
    }

    pub fn clear_backup_files(&self) -> io::Result<()> {
        match &self.backup {
            Some(backup) => backup.clear(),
            None => Ok(()),
        }
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn buffered_chunks(&self) -> usize {
        let sealed = self.sealed.lock().expect("lock poisoned").len();
        let current = self
            .current
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|slot| slot.lock().expect("lock poisoned").is_some())
            .count();
        sealed + current
    }

    pub fn has_pending(&self) -> bool {
        self.buffered_chunks() > 0
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("allocated", &self.allocated_bytes())
            .field("buffered_chunks", &self.buffered_chunks())
            .field("ack_response_mode", &self.ack_response_mode)
            .finish()
    }
}
