//! Line framing over TCP halves.

use std::fmt;
use std::io;

use svhost_protocol::DEFAULT_TERMINATOR;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Longest record accepted from a peer before the read fails.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Record terminator written after every outbound line and expected after
/// every inbound one.
#[derive(Clone, PartialEq, Eq)]
pub struct Terminator(Vec<u8>);

impl Terminator {
    /// Parse a terminator written with escapes (`\r`, `\n`, `\t`, `\0`, `\\`).
    /// An empty string yields the default `\r\n`.
    pub fn from_escaped(raw: &str) -> Self {
        let mut bytes = Vec::with_capacity(raw.len());
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                continue;
            }
            match chars.next() {
                Some('r') => bytes.push(b'\r'),
                Some('n') => bytes.push(b'\n'),
                Some('t') => bytes.push(b'\t'),
                Some('0') => bytes.push(0),
                Some('\\') => bytes.push(b'\\'),
                Some(other) => {
                    bytes.push(b'\\');
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                }
                None => bytes.push(b'\\'),
            }
        }
        if bytes.is_empty() {
            return Self::default();
        }
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn last(&self) -> u8 {
        self.0[self.0.len() - 1]
    }

    /// Strip the terminator from a buffer that ends with its final byte.
    /// A `\r\n` terminator also accepts a bare `\n`.
    fn strip(&self, buf: &mut Vec<u8>) -> bool {
        if buf.ends_with(&self.0) {
            buf.truncate(buf.len() - self.0.len());
            return true;
        }
        if self.0 == b"\r\n" && buf.ends_with(b"\n") {
            buf.pop();
            return true;
        }
        false
    }
}

impl Default for Terminator {
    fn default() -> Self {
        Self(DEFAULT_TERMINATOR.as_bytes().to_vec())
    }
}

impl fmt::Debug for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Terminator({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// Reads terminator-delimited records.
pub struct LineReader {
    inner: BufReader<OwnedReadHalf>,
    terminator: Terminator,
    buf: Vec<u8>,
}

impl LineReader {
    pub fn new(half: OwnedReadHalf, terminator: Terminator) -> Self {
        Self {
            inner: BufReader::new(half),
            terminator,
            buf: Vec::new(),
        }
    }

    /// Read the next record. `Ok(None)` at end of stream; a trailing
    /// unterminated record is returned before that. A record longer than
    /// [`MAX_LINE_LEN`] fails with `InvalidData` without buffering the rest.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        let last = self.terminator.last();
        let cap = MAX_LINE_LEN + self.terminator.as_bytes().len();
        loop {
            let room = cap.saturating_sub(self.buf.len()) as u64;
            let n = (&mut self.inner)
                .take(room)
                .read_until(last, &mut self.buf)
                .await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take()));
            }
            let stripped = self.terminator.strip(&mut self.buf);
            if stripped && self.buf.len() <= MAX_LINE_LEN {
                return Ok(Some(self.take()));
            }
            if stripped || self.buf.len() >= cap {
                self.buf.clear();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "record exceeds maximum line length",
                ));
            }
        }
    }

    fn take(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        line
    }
}

/// Writes terminator-delimited records.
pub struct LineWriter {
    inner: OwnedWriteHalf,
    terminator: Terminator,
}

impl LineWriter {
    pub fn new(half: OwnedWriteHalf, terminator: Terminator) -> Self {
        Self { inner: half, terminator }
    }

    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut record = Vec::with_capacity(line.len() + self.terminator.as_bytes().len());
        record.extend_from_slice(line.as_bytes());
        record.extend_from_slice(self.terminator.as_bytes());
        self.inner.write_all(&record).await?;
        self.inner.flush().await
    }

    /// Close the write direction. Errors are ignored; the peer may already be gone.
    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}
