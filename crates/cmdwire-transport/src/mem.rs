//! In-memory connection pair.
//!
//! [`connection`] returns the server half as an [`Upgraded`] plus a
//! [`MemPeer`] that plays the remote client. Used to drive sessions without
//! a socket.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::{CloseFrame, Inbound, MessageSink, MessageSource, TransportError, Upgraded};

const CHANNEL_CAPACITY: usize = 64;

/// What the server wrote, as observed by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Binary(Bytes),
    Ping,
    Close(CloseFrame),
}

pub struct MemSource {
    rx: mpsc::Receiver<Inbound>,
}

pub struct MemSink {
    tx: Option<mpsc::Sender<Outbound>>,
    fail_writes: Arc<AtomicBool>,
}

/// Remote end of an in-memory connection.
pub struct MemPeer {
    tx: Option<mpsc::Sender<Inbound>>,
    rx: mpsc::Receiver<Outbound>,
    fail_writes: Arc<AtomicBool>,
}

/// Create a connected server half and peer.
pub fn connection() -> (Upgraded<MemSource, MemSink>, MemPeer) {
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let fail_writes = Arc::new(AtomicBool::new(false));

    let upgraded = Upgraded {
        source: MemSource { rx: in_rx },
        sink: MemSink {
            tx: Some(out_tx),
            fail_writes: fail_writes.clone(),
        },
        remote_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
    };
    let peer = MemPeer {
        tx: Some(in_tx),
        rx: out_rx,
        fail_writes,
    };
    (upgraded, peer)
}

impl MemSink {
    async fn push(&mut self, item: Outbound) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(item).await.map_err(|_| TransportError::Closed)
    }
}

impl MessageSource for MemSource {
    async fn next_message(&mut self) -> Option<Result<Inbound, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

impl MessageSink for MemSink {
    async fn send_binary(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.push(Outbound::Binary(data)).await
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.push(Outbound::Ping).await
    }

    async fn send_close(&mut self, frame: CloseFrame) -> Result<(), TransportError> {
        self.push(Outbound::Close(frame)).await
    }

    async fn shutdown(&mut self) {
        self.tx = None;
    }
}

impl MemPeer {
    pub async fn send(&self, message: Inbound) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(message).await.map_err(|_| TransportError::Closed)
    }

    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        self.send(Inbound::Binary(data.into())).await
    }

    /// Next item written by the server. `None` once the server shut the sink down.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    /// End the inbound stream without a close frame.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }

    /// Make every subsequent server write fail.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::Release);
    }
}
