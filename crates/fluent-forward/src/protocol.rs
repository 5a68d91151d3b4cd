//! Forward-protocol request framing and ack tokens.
//!
//! A PackedForward request is a MessagePack array of three elements:
//!
//! ```text
//! [ tag(str), entries(str of concatenated [ts, record] pairs), options(map) ]
//! ```
//!
//! `options` always carries `"size"` (the entry count of the chunk); in ack
//! mode it also carries `"chunk"`, the base64 of the chunk's 16-byte UUID,
//! which the upstream must echo back as `{"ack": <same base64>}`.
//!
//! The three segments are kept separate so the chunk payload is shipped
//! without copying it into the frame.

use std::io::{self, Cursor, Read};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::event::{value_write_err, Timestamp};

/// Upper bound on the ack response we are willing to read.
pub(crate) const ACK_RESPONSE_LIMIT: usize = 256;

#[derive(Debug, Serialize)]
struct RequestOption<'a> {
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk: Option<&'a str>,
}

/// The single map the upstream sends back in ack mode.
#[derive(Debug, Deserialize)]
pub(crate) struct AckResponse {
    pub ack: String,
}

/// A framed request ready for a sender: three segments plus the token the
/// upstream is expected to echo (ack mode only).
#[derive(Debug, Clone)]
pub(crate) struct ForwardRequest {
    pub segments: Vec<Bytes>,
    pub ack_token: Option<String>,
}

/// Base64 form of a chunk id, used both as ack token and in spill filenames.
pub(crate) fn chunk_token(chunk_id: &[u8; 16]) -> String {
    BASE64.encode(chunk_id)
}

/// Appends one `[ts, record]` entry to a chunk region.
pub(crate) fn encode_entry(
    out: &mut Vec<u8>,
    ts: Timestamp,
    record_map: &[u8],
) -> io::Result<()> {
    rmp::encode::write_array_len(out, 2).map_err(value_write_err)?;
    ts.encode_into(out)?;
    out.extend_from_slice(record_map);
    Ok(())
}

/// Frames a sealed chunk into the 3-element Forward request.
pub(crate) fn build_request(
    tag: &str,
    payload: Bytes,
    event_count: u64,
    chunk_id: Option<&[u8; 16]>,
) -> io::Result<ForwardRequest> {
    let mut header = Vec::with_capacity(tag.len() + 16);
    rmp::encode::write_array_len(&mut header, 3).map_err(value_write_err)?;
    rmp::encode::write_str(&mut header, tag).map_err(value_write_err)?;
    rmp::encode::write_str_len(&mut header, payload.len() as u32).map_err(value_write_err)?;

    let ack_token = chunk_id.map(chunk_token);
    let option = RequestOption {
        size: event_count,
        chunk: ack_token.as_deref(),
    };
    let option_bytes = rmp_serde::to_vec_named(&option)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok(ForwardRequest {
        segments: vec![header.into(), payload, option_bytes.into()],
        ack_token,
    })
}

/// Counts the `[ts, record]` entries in a raw chunk payload.
///
/// Used when rehydrating spill files, where the in-memory event count was
/// lost. Fails on anything that is not a clean sequence of 2-element arrays.
pub(crate) fn count_entries(payload: &[u8]) -> io::Result<u64> {
    let mut cur = Cursor::new(payload);
    let mut count = 0u64;
    while (cur.position() as usize) < payload.len() {
        let len = rmp::decode::read_array_len(&mut cur)
            .map_err(|e| invalid_data(format!("expected entry array: {e:?}")))?;
        if len != 2 {
            return Err(invalid_data(format!("entry array of length {len}")));
        }
        skip_value(&mut cur)?;
        skip_value(&mut cur)?;
        count += 1;
    }
    Ok(count)
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Skips a single MessagePack value of any shape.
fn skip_value(cur: &mut Cursor<&[u8]>) -> io::Result<()> {
    use rmp::Marker;

    let marker = rmp::decode::read_marker(cur)
        .map_err(|e| invalid_data(format!("bad marker: {e:?}")))?;
    match marker {
        Marker::Null
        | Marker::True
        | Marker::False
        | Marker::FixPos(_)
        | Marker::FixNeg(_) => {}
        Marker::U8 | Marker::I8 => skip_bytes(cur, 1)?,
        Marker::U16 | Marker::I16 => skip_bytes(cur, 2)?,
        Marker::U32 | Marker::I32 | Marker::F32 => skip_bytes(cur, 4)?,
        Marker::U64 | Marker::I64 | Marker::F64 => skip_bytes(cur, 8)?,
        Marker::FixStr(n) => skip_bytes(cur, n as u64)?,
        Marker::Str8 | Marker::Bin8 => {
            let n = read_be_len(cur, 1)?;
            skip_bytes(cur, n)?;
        }
        Marker::Str16 | Marker::Bin16 => {
            let n = read_be_len(cur, 2)?;
            skip_bytes(cur, n)?;
        }
        Marker::Str32 | Marker::Bin32 => {
            let n = read_be_len(cur, 4)?;
            skip_bytes(cur, n)?;
        }
        Marker::FixArray(n) => {
            for _ in 0..n {
                skip_value(cur)?;
            }
        }
        Marker::Array16 | Marker::Array32 => {
            let n = read_be_len(cur, if marker == Marker::Array16 { 2 } else { 4 })?;
            for _ in 0..n {
                skip_value(cur)?;
            }
        }
        Marker::FixMap(n) => {
            for _ in 0..(n as u64 * 2) {
                skip_value(cur)?;
            }
        }
        Marker::Map16 | Marker::Map32 => {
            let n = read_be_len(cur, if marker == Marker::Map16 { 2 } else { 4 })?;
            for _ in 0..(n * 2) {
                skip_value(cur)?;
            }
        }
        Marker::FixExt1 => skip_bytes(cur, 2)?,
        Marker::FixExt2 => skip_bytes(cur, 3)?,
        Marker::FixExt4 => skip_bytes(cur, 5)?,
        Marker::FixExt8 => skip_bytes(cur, 9)?,
        Marker::FixExt16 => skip_bytes(cur, 17)?,
        Marker::Ext8 | Marker::Ext16 | Marker::Ext32 => {
            let width = match marker {
                Marker::Ext8 => 1,
                Marker::Ext16 => 2,
                _ => 4,
            };
            let n = read_be_len(cur, width)?;
            skip_bytes(cur, n + 1)?;
        }
        Marker::Reserved => return Err(invalid_data("reserved marker".into())),
    }
    Ok(())
}

fn read_be_len(cur: &mut Cursor<&[u8]>, width: usize) -> io::Result<u64> {
    let mut buf = [0u8; 4];
    cur.read_exact(&mut buf[4 - width..])?;
    Ok(u32::from_be_bytes(buf) as u64)
}

fn skip_bytes(cur: &mut Cursor<&[u8]>, n: u64) -> io::Result<()> {
    let pos = cur.position();
    let end = pos
        .checked_add(n)
        .ok_or_else(|| invalid_data("length overflow".into()))?;
    if end > cur.get_ref().len() as u64 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated msgpack value",
        ));
    }
    cur.set_position(end);
    Ok(())
}
