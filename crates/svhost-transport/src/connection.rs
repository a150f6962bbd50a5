//! Connections: one unit of concurrency bound to a service.
//!
//! A connection is either backed by an accepted TCP socket or purely
//! internal, representing one of the service's own worker loops.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use svhost_protocol::BUSY_MESSAGE;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::lines::{LineReader, LineWriter, Terminator};

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        write!(f, "conn-{}", &simple[..8])
    }
}

/// A socket-backed or internal connection.
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    reader: Option<LineReader>,
    writer: Option<LineWriter>,
    socket: bool,
    properties: HashMap<String, String>,
    active: Arc<AtomicBool>,
    connected_at: DateTime<Utc>,
}

impl Connection {
    /// Wrap an accepted socket.
    pub fn from_socket(stream: TcpStream, peer: SocketAddr, terminator: Terminator) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            id: ConnectionId::new(),
            peer: Some(peer),
            reader: Some(LineReader::new(read_half, terminator.clone())),
            writer: Some(LineWriter::new(write_half, terminator)),
            socket: true,
            properties: HashMap::new(),
            active: Arc::new(AtomicBool::new(true)),
            connected_at: Utc::now(),
        }
    }

    /// A socket-less connection for a service's own background loop.
    pub fn internal() -> Self {
        Self {
            id: ConnectionId::new(),
            peer: None,
            reader: None,
            writer: None,
            socket: false,
            properties: HashMap::new(),
            active: Arc::new(AtomicBool::new(true)),
            connected_at: Utc::now(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Internal connections carry no socket and bypass admission limits.
    pub fn is_internal(&self) -> bool {
        !self.socket
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Shared handle to the `active` flag, so the owner can clear it from outside.
    pub fn active_flag(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// Read one record. `Ok(None)` when the peer closed the stream or the
    /// connection has been deactivated.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        if !self.is_active() {
            return Ok(None);
        }
        match self.reader.as_mut() {
            Some(reader) => reader.read_line().await,
            None => Err(not_connected()),
        }
    }

    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write_line(line).await,
            None => Err(not_connected()),
        }
    }

    /// Detach the stream halves so the caller can drive one primary loop
    /// plus one auxiliary reader. Returns `None` for internal connections
    /// or if the halves were already taken.
    pub fn take_split(&mut self) -> Option<(LineReader, LineWriter)> {
        match (self.reader.take(), self.writer.take()) {
            (Some(reader), Some(writer)) => Some((reader, writer)),
            (reader, writer) => {
                self.reader = reader;
                self.writer = writer;
                None
            }
        }
    }

    /// Deactivate and close both directions. Never fails.
    pub async fn close(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await;
        }
        self.reader = None;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("internal", &self.is_internal())
            .field("active", &self.is_active())
            .finish()
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection has no socket")
}

/// Tell a client the server is busy and close the socket. Errors are
/// swallowed; the client may already have gone.
pub async fn refuse(mut stream: TcpStream, terminator: &Terminator) {
    let mut record = BUSY_MESSAGE.as_bytes().to_vec();
    record.extend_from_slice(terminator.as_bytes());
    if let Err(e) = stream.write_all(&record).await {
        debug!("Failed to write busy message: {e}");
    }
    let _ = stream.shutdown().await;
}
