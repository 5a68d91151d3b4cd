//! In-process mock Forward-protocol upstream for integration tests.
//!
//! Accepts TCP connections, decodes PackedForward requests, records every
//! entry, and (unless muted) echoes ack tokens. Also tracks connection
//! counts so failover tests can assert how clients moved between upstreams.

#![allow(dead_code)]

use std::io::{self, Cursor};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Route library logs through the test harness; safe to call repeatedly.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Timestamp of a received entry, in whichever encoding the client used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireTime {
    Unix(u64),
    EventTime { secs: u32, nanos: u32 },
}

#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub tag: String,
    pub declared_size: Option<u64>,
    pub chunk: Option<String>,
    pub entries: Vec<(WireTime, Value)>,
}

#[derive(Default)]
pub struct UpstreamState {
    received: Mutex<Vec<ReceivedRequest>>,
    connections: AtomicUsize,
    /// When set, requests are recorded but never acknowledged.
    silent: AtomicBool,
}

pub struct MockUpstream {
    pub addr: SocketAddr,
    state: Arc<UpstreamState>,
    accept_task: JoinHandle<()>,
    conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        Self::start_on(0).await
    }

    /// Binds to the given port (0 picks a free one); used to restart an
    /// upstream on the address a forwarder is already configured with.
    pub async fn start_on(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("failed to bind mock upstream");
        let addr = listener.local_addr().expect("failed to get local addr");

        let state = Arc::new(UpstreamState::default());
        let conn_tasks = Arc::new(Mutex::new(Vec::new()));

        let accept_state = state.clone();
        let accept_conns = conn_tasks.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let state = accept_state.clone();
                let task = tokio::spawn(async move {
                    let _ = handle_conn(stream, state).await;
                });
                accept_conns.lock().unwrap().push(task);
            }
        });

        MockUpstream {
            addr,
            state,
            accept_task,
            conn_tasks,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stops accepting and severs every open connection.
    pub fn stop(&self) {
        self.accept_task.abort();
        for task in self.conn_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Keep reading requests but never send acks.
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn records_for(&self, tag: &str) -> Vec<Value> {
        self.requests()
            .iter()
            .filter(|req| req.tag == tag)
            .flat_map(|req| req.entries.iter().map(|(_, record)| record.clone()))
            .collect()
    }

    pub fn total_records(&self) -> usize {
        self.requests()
            .iter()
            .map(|req| req.entries.len())
            .sum()
    }

    pub fn chunk_tokens(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|req| req.chunk.clone())
            .collect()
    }

    /// Polls until `expected` entries have been recorded. Needed for
    /// non-ack runs, where the client's send completes before this side
    /// has parsed the frame.
    pub async fn wait_for_records(&self, expected: usize, timeout: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.total_records() < expected {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        true
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_conn(mut stream: TcpStream, state: Arc<UpstreamState>) -> io::Result<()> {
    let mut pending: Vec<u8> = Vec::new();
    let mut read_buf = [0u8; 8192];
    loop {
        let n = stream.read(&mut read_buf).await?;
        if n == 0 {
            return Ok(());
        }
        pending.extend_from_slice(&read_buf[..n]);

        loop {
            match try_parse_request(&pending) {
                Ok(Some((request, consumed))) => {
                    pending.drain(..consumed);
                    let ack = request.chunk.clone();
                    state.received.lock().unwrap().push(request);

                    if let Some(token) = ack {
                        if !state.silent.load(Ordering::SeqCst) {
                            let reply =
                                rmp_serde::to_vec_named(&serde_json::json!({ "ack": token }))
                                    .expect("ack encode");
                            stream.write_all(&reply).await?;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Attempts to decode one complete request from the front of `data`.
/// Returns `None` when more bytes are needed.
fn try_parse_request(data: &[u8]) -> io::Result<Option<(ReceivedRequest, usize)>> {
    let mut cur = Cursor::new(data);
    match parse_request(&mut cur) {
        Ok(request) => Ok(Some((request, cur.position() as usize))),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

fn parse_request(cur: &mut Cursor<&[u8]>) -> io::Result<ReceivedRequest> {
    let arity = rmp::decode::read_array_len(cur).map_err(value_read_err)?;
    if arity != 3 {
        return Err(invalid_data(format!("request array of length {arity}")));
    }

    let tag = read_string(cur)?;

    let payload_len = rmp::decode::read_str_len(cur).map_err(value_read_err)? as usize;
    let mut payload = vec![0u8; payload_len];
    std::io::Read::read_exact(cur, &mut payload)?;

    let mut declared_size = None;
    let mut chunk = None;
    let option_entries = rmp::decode::read_map_len(cur).map_err(value_read_err)?;
    for _ in 0..option_entries {
        let key = read_string(cur)?;
        match key.as_str() {
            "size" => declared_size = Some(rmp::decode::read_int(cur).map_err(num_read_err)?),
            "chunk" => chunk = Some(read_string(cur)?),
            other => return Err(invalid_data(format!("unexpected option key {other:?}"))),
        }
    }

    let entries = parse_entries(&payload)?;
    Ok(ReceivedRequest {
        tag,
        declared_size,
        chunk,
        entries,
    })
}

fn parse_entries(payload: &[u8]) -> io::Result<Vec<(WireTime, Value)>> {
    let mut cur = Cursor::new(payload);
    let mut entries = Vec::new();
    while (cur.position() as usize) < payload.len() {
        let arity = rmp::decode::read_array_len(&mut cur).map_err(value_read_err)?;
        if arity != 2 {
            return Err(invalid_data(format!("entry array of length {arity}")));
        }
        let time = parse_time(&mut cur)?;
        let record = Value::deserialize(&mut rmp_serde::Deserializer::new(&mut cur))
            .map_err(|e| invalid_data(format!("bad record: {e}")))?;
        entries.push((time, record));
    }
    Ok(entries)
}

fn parse_time(cur: &mut Cursor<&[u8]>) -> io::Result<WireTime> {
    let data = *cur.get_ref();
    let pos = cur.position() as usize;
    // fixext8 of type 0 is Fluentd's EventTime.
    if data.get(pos) == Some(&0xd7) {
        if data.get(pos + 1) != Some(&0x00) {
            return Err(invalid_data("unexpected ext type for timestamp".into()));
        }
        if data.len() < pos + 10 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let secs = u32::from_be_bytes(data[pos + 2..pos + 6].try_into().expect("4 bytes"));
        let nanos = u32::from_be_bytes(data[pos + 6..pos + 10].try_into().expect("4 bytes"));
        cur.set_position((pos + 10) as u64);
        return Ok(WireTime::EventTime { secs, nanos });
    }
    let secs = rmp::decode::read_int(cur).map_err(num_read_err)?;
    Ok(WireTime::Unix(secs))
}

fn read_string(cur: &mut Cursor<&[u8]>) -> io::Result<String> {
    let len = rmp::decode::read_str_len(cur).map_err(value_read_err)? as usize;
    let mut buf = vec![0u8; len];
    std::io::Read::read_exact(cur, &mut buf)?;
    String::from_utf8(buf).map_err(|e| invalid_data(format!("non-utf8 string: {e}")))
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn value_read_err(e: rmp::decode::ValueReadError<io::Error>) -> io::Error {
    match e {
        rmp::decode::ValueReadError::InvalidMarkerRead(e)
        | rmp::decode::ValueReadError::InvalidDataRead(e) => e,
        rmp::decode::ValueReadError::TypeMismatch(marker) => {
            invalid_data(format!("unexpected marker {marker:?}"))
        }
    }
}

fn num_read_err(e: rmp::decode::NumValueReadError<io::Error>) -> io::Error {
    match e {
        rmp::decode::NumValueReadError::InvalidMarkerRead(e)
        | rmp::decode::NumValueReadError::InvalidDataRead(e) => e,
        other => invalid_data(format!("bad integer: {other:?}")),
    }
}
