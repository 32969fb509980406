//! Message-oriented duplex connection seam.
//!
//! The session engine never touches sockets directly. It reads through a
//! [`MessageSource`] and writes through a [`MessageSink`]; one transport
//! message is one frame. Deadlines are applied by the caller with
//! `tokio::time::timeout`.

use std::future::Future;
use std::net::SocketAddr;

use bytes::Bytes;
use thiserror::Error;

/// Close codes used by the server.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const POLICY_VIOLATION: u16 = 1008;
}

/// Transport-level close notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new(close_code::NORMAL, "")
    }
}

/// One message received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Binary(Bytes),
    Text(Bytes),
    Ping,
    Pong,
    Close(Option<CloseFrame>),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("listener did not shut down within the deadline")]
    ShutdownTimedOut,
}

/// Read half of an upgraded connection.
pub trait MessageSource: Send + 'static {
    /// Wait for the next message. `None` means the stream ended.
    fn next_message(&mut self) -> impl Future<Output = Option<Result<Inbound, TransportError>>> + Send;
}

/// Write half of an upgraded connection. Only one task may own it.
pub trait MessageSink: Send + 'static {
    fn send_binary(&mut self, data: Bytes) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn send_ping(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn send_close(&mut self, frame: CloseFrame) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Flush and close the underlying transport. Errors are swallowed.
    fn shutdown(&mut self) -> impl Future<Output = ()> + Send;
}

/// An already-upgraded connection handed to the session engine.
pub struct Upgraded<S, K> {
    pub source: S,
    pub sink: K,
    pub remote_addr: SocketAddr,
}
