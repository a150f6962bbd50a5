//! svhost Transport Layer
//!
//! Socket plumbing shared by every hosted service:
//! - Line framing with a configurable record terminator
//! - Socket-backed and internal (socket-less) connections
//! - The per-service accept loop and the busy-rejection path
//!
//! The transport is decoupled from service lifecycle via the `Acceptor` trait.

pub mod connection;
pub mod lines;
pub mod listener;

pub use connection::{Connection, ConnectionId, refuse};
pub use lines::{LineReader, LineWriter, Terminator};
pub use listener::{Acceptor, Listener};
