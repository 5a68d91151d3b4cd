//! Event timestamps and record serialization.
//!
//! Fluentd accepts two timestamp encodings inside a PackedForward entry: a
//! plain MessagePack integer of epoch seconds, or the `EventTime` extension
//! type (type 0, fixext8) carrying seconds and nanoseconds as two big-endian
//! u32 halves.

use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::config::RecordSerializer;
use crate::error::EmitError;

/// Fluentd `EventTime`: 32-bit epoch seconds plus 32-bit nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTime {
    secs: u32,
    nanos: u32,
}

impl EventTime {
    pub fn new(secs: u32, nanos: u32) -> Self {
        EventTime { secs, nanos }
    }

    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        EventTime {
            secs: elapsed.as_secs() as u32,
            nanos: elapsed.subsec_nanos(),
        }
    }

    pub fn secs(&self) -> u32 {
        self.secs
    }

    pub fn nanos(&self) -> u32 {
        self.nanos
    }
}

/// Timestamp of a single entry, in either wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamp {
    /// Epoch seconds, encoded as the smallest MessagePack unsigned int.
    Unix(u64),
    /// Sub-second precision, encoded as fixext8 type 0.
    EventTime(EventTime),
}

impl Timestamp {
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Timestamp::Unix(secs)
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) -> io::Result<()> {
        match self {
            Timestamp::Unix(secs) => {
                rmp::encode::write_uint(out, *secs).map_err(value_write_err)?;
            }
            Timestamp::EventTime(t) => {
                rmp::encode::write_ext_meta(out, 8, 0).map_err(value_write_err)?;
                out.extend_from_slice(&t.secs.to_be_bytes());
                out.extend_from_slice(&t.nanos.to_be_bytes());
            }
        }
        Ok(())
    }
}

impl From<EventTime> for Timestamp {
    fn from(t: EventTime) -> Self {
        Timestamp::EventTime(t)
    }
}

pub(crate) fn value_write_err(e: rmp::encode::ValueWriteError<io::Error>) -> io::Error {
    match e {
        rmp::encode::ValueWriteError::InvalidMarkerWrite(e)
        | rmp::encode::ValueWriteError::InvalidDataWrite(e) => e,
    }
}

/// Serializes a record map with the configured serializer, enforcing that
/// the result is fed from a JSON object (Fluentd records are maps).
pub(crate) fn serialize_record(
    serializer: Option<&RecordSerializer>,
    record: &Value,
) -> Result<Vec<u8>, EmitError> {
    if !record.is_object() {
        return Err(EmitError::RecordNotAMap);
    }
    match serializer {
        Some(custom) => custom(record).map_err(EmitError::Serialize),
        None => rmp_serde::to_vec(record).map_err(EmitError::Serialize),
    }
}
