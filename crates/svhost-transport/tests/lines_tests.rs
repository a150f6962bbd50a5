//! Line framing tests over loopback sockets.

use std::io::ErrorKind;

use svhost_transport::lines::MAX_LINE_LEN;
use svhost_transport::{LineReader, Terminator};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Connected (client, server) pair on an ephemeral port.
async fn pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

/// Write `payload` from a background task and return a reader on the other end.
async fn reader_for(payload: Vec<u8>, terminator: Terminator) -> LineReader {
    let (mut client, server) = pair().await;
    tokio::spawn(async move {
        // The reader may stop early and reset the socket.
        let _ = client.write_all(&payload).await;
        let _ = client.shutdown().await;
    });
    let (read_half, _write_half) = server.into_split();
    LineReader::new(read_half, terminator)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn oversized_record_is_rejected() {
    let mut payload = vec![b'x'; 4 * MAX_LINE_LEN];
    payload.extend_from_slice(b"\r\n");
    let mut reader = reader_for(payload, Terminator::default()).await;

    let err = reader.read_line().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidData);
}

#[tokio::test]
async fn oversized_record_without_terminator_is_rejected() {
    let payload = vec![b'x'; MAX_LINE_LEN + 10];
    let mut reader = reader_for(payload, Terminator::default()).await;

    let err = reader.read_line().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidData);
}

#[tokio::test]
async fn record_at_the_limit_is_accepted() {
    let mut payload = vec![b'y'; MAX_LINE_LEN];
    payload.extend_from_slice(b"\r\nnext\r\n");
    let mut reader = reader_for(payload, Terminator::default()).await;

    let line = reader.read_line().await.unwrap().unwrap();
    assert_eq!(line.len(), MAX_LINE_LEN);
    assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("next"));
    assert_eq!(reader.read_line().await.unwrap(), None);
}

#[tokio::test]
async fn bare_newline_and_trailing_record() {
    let mut reader = reader_for(b"one\ntwo\r\ntail".to_vec(), Terminator::default()).await;

    assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("one"));
    assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("two"));
    assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("tail"));
    assert_eq!(reader.read_line().await.unwrap(), None);
}

#[tokio::test]
async fn custom_terminator() {
    let terminator = Terminator::from_escaped("\\0");
    let mut reader = reader_for(b"a\nb\0c\0".to_vec(), terminator).await;

    assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("a\nb"));
    assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("c"));
    assert_eq!(reader.read_line().await.unwrap(), None);
}
