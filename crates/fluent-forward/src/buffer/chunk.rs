//! A chunk: one tag's growable MessagePack byte region.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use uuid::Uuid;

/// A per-tag byte region holding concatenated `[ts, record]` entries.
///
/// `capacity` is the logical budget charged against the buffer's global
/// allocation counter; it is tracked separately from the backing `Vec` so
/// allocator rounding never skews the accounting.
#[derive(Debug)]
pub(crate) struct Chunk {
    tag: String,
    chunk_id: [u8; 16],
    data: Vec<u8>,
    capacity: usize,
    events: u64,
    opened_at: Instant,
    created_at_unix_ms: u64,
}

impl Chunk {
    pub fn new(tag: &str, capacity: usize) -> Self {
        Chunk {
            tag: tag.to_owned(),
            chunk_id: Uuid::new_v4().into_bytes(),
            data: Vec::with_capacity(capacity),
            capacity,
            events: 0,
            opened_at: Instant::now(),
            created_at_unix_ms: unix_millis_now(),
        }
    }

    /// Rebuilds a sealed chunk from a spill file. Its capacity is exactly its
    /// length; it never grows again.
    pub fn from_backup(
        tag: String,
        chunk_id: [u8; 16],
        created_at_unix_ms: u64,
        data: Vec<u8>,
        events: u64,
    ) -> Self {
        let capacity = data.len();
        Chunk {
            tag,
            chunk_id,
            data,
            capacity,
            events,
            opened_at: Instant::now(),
            created_at_unix_ms,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn chunk_id(&self) -> &[u8; 16] {
        &self.chunk_id
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn events(&self) -> u64 {
        self.events
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    pub fn created_at_unix_ms(&self) -> u64 {
        self.created_at_unix_ms
    }

    /// Raises the logical capacity. Callers must have charged the delta
    /// against the global budget first.
    pub fn grow_to(&mut self, capacity: usize) {
        debug_assert!(capacity >= self.capacity);
        self.data.reserve(capacity - self.data.len());
        self.capacity = capacity;
    }

    /// Appends one already-encoded entry. Callers must have ensured room.
    pub fn push_entry(&mut self, entry: &[u8]) {
        debug_assert!(entry.len() <= self.remaining());
        self.data.extend_from_slice(entry);
        self.events += 1;
    }

    pub fn payload(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    pub fn raw(&self) -> &[u8] {
        &self.data
    }
}

fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
