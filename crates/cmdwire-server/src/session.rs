//! One connected peer.
//!
//! A session owns a bounded outbound queue and a single write task that is
//! the only thing allowed to touch the transport sink. Outbound frames,
//! keepalive pings and the final close frame all go through that task.
//! Closing is idempotent: the first caller records the cause and close
//! frame, cancels the session's lifecycle token and closes the queue; the
//! write task then sends the close frame and shuts the transport down.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use cmdwire_transport::{CloseFrame, MessageSink, TransportError};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::error::SessionError;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// The peer sent a close frame or ended the stream.
    PeerClosed,
    /// `Session::close` was called.
    Local,
    RateLimited,
    ProtocolError,
    TransportError,
    ReadTimeout,
    ServerShutdown,
}

impl CloseCause {
    /// Only a peer-initiated close counts as voluntary.
    pub fn is_voluntary(&self) -> bool {
        matches!(self, Self::PeerClosed)
    }
}

#[derive(Default)]
struct CloseState {
    cause: Option<CloseCause>,
    frame: Option<CloseFrame>,
}

pub struct Session {
    id: String,
    remote_addr: String,
    connected_at: DateTime<Utc>,
    config: SessionConfig,
    closed: AtomicBool,
    lifecycle: CancellationToken,
    close_state: Mutex<CloseState>,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    writer_done: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Session {
    fn new(remote_addr: String, config: SessionConfig, tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            remote_addr,
            connected_at: Utc::now(),
            config,
            closed: AtomicBool::new(false),
            lifecycle: CancellationToken::new(),
            close_state: Mutex::new(CloseState::default()),
            outbound: Mutex::new(Some(tx)),
            writer: Mutex::new(None),
            writer_done: CancellationToken::new(),
        }
    }

    /// Create a session over `sink` and start its write task.
    pub fn spawn<K: MessageSink>(
        remote_addr: impl Into<String>,
        sink: K,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.outbound_capacity.max(1));
        let session = Arc::new(Self::new(remote_addr.into(), config, tx));
        let handle = tokio::spawn(write_loop(session.clone(), sink, rx));
        *session.writer.lock() = Some(handle);
        session
    }

    /// A session with no write task; the test holds the queue's receiving end.
    #[cfg(test)]
    pub(crate) fn detached(config: SessionConfig) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(config.outbound_capacity.max(1));
        let session = Self::new("127.0.0.1:0".into(), config, tx);
        session.writer_done.cancel();
        (Arc::new(session), rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// True until teardown completes: the session is closed and its write
    /// task has finished or been aborted.
    pub fn is_alive(&self) -> bool {
        !(self.is_closing() && self.writer_done.is_cancelled())
    }

    /// True once teardown has started. Sends are refused from this point.
    pub fn is_closing(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Set once the session starts closing.
    pub fn close_cause(&self) -> Option<CloseCause> {
        self.close_state.lock().cause
    }

    /// Resolves when the session starts closing.
    pub async fn cancelled(&self) {
        self.lifecycle.cancelled().await
    }

    /// Resolves when teardown has completed.
    pub async fn closed(&self) {
        self.writer_done.cancelled().await
    }

    /// A token that is cancelled with the session. Cancelling it does not
    /// close the session.
    pub fn lifecycle_token(&self) -> CancellationToken {
        self.lifecycle.child_token()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sending
    // ─────────────────────────────────────────────────────────────────────

    /// Queue a frame, waiting at most the configured send timeout for room.
    pub async fn send(&self, command_id: u32, payload: &[u8]) -> Result<(), SessionError> {
        self.send_with_deadline(command_id, payload, self.send_deadline()).await
    }

    pub async fn send_with_deadline(
        &self,
        command_id: u32,
        payload: &[u8],
        deadline: Instant,
    ) -> Result<(), SessionError> {
        let frame = cmdwire_protocol::encode(command_id, payload)?;
        self.send_frame(frame, deadline).await
    }

    /// Queue a frame, waiting for room until `cancel` fires.
    pub async fn send_until(
        &self,
        command_id: u32,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let frame = cmdwire_protocol::encode(command_id, payload)?;
        self.enqueue(frame, cancel.cancelled(), SessionError::Cancelled).await
    }

    pub(crate) fn send_deadline(&self) -> Instant {
        Instant::now() + self.config.send_timeout
    }

    /// Queue an already-encoded frame.
    pub(crate) async fn send_frame(&self, frame: Bytes, deadline: Instant) -> Result<(), SessionError> {
        self.enqueue(frame, tokio::time::sleep_until(deadline), SessionError::DeadlineExceeded)
            .await
    }

    async fn enqueue<F>(&self, frame: Bytes, give_up: F, on_give_up: SessionError) -> Result<(), SessionError>
    where
        F: Future<Output = ()>,
    {
        if self.is_closing() {
            return Err(SessionError::ConnectionClosed);
        }
        let tx = self.outbound.lock().clone().ok_or(SessionError::ConnectionClosed)?;

        let frame = match tx.try_send(frame) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(SessionError::ConnectionClosed),
            Err(TrySendError::Full(frame)) => frame,
        };

        tokio::select! {
            biased;
            _ = self.lifecycle.cancelled() => Err(SessionError::ConnectionClosed),
            sent = tx.send(frame) => sent.map_err(|_| SessionError::ConnectionClosed),
            _ = give_up => Err(on_give_up),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Closing
    // ─────────────────────────────────────────────────────────────────────

    /// Close with `code` and `reason`. Later calls are no-ops.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), SessionError> {
        self.close_with(CloseCause::Local, CloseFrame::new(code, reason)).await;
        Ok(())
    }

    pub(crate) async fn close_with(&self, cause: CloseCause, frame: CloseFrame) {
        if !self.begin_close(cause, Some(frame)) {
            return;
        }
        debug!(session_id = %self.id, ?cause, "session closing");

        let grace = self.config.close_grace * 2;
        if tokio::time::timeout(grace, self.writer_done.cancelled()).await.is_err() {
            warn!(session_id = %self.id, "writer did not finish within {grace:?}, aborting");
            self.abort_writer();
        }
    }

    /// Returns `false` if the session was already closing.
    fn begin_close(&self, cause: CloseCause, frame: Option<CloseFrame>) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        {
            let mut state = self.close_state.lock();
            state.cause = Some(cause);
            state.frame = frame;
        }
        self.lifecycle.cancel();
        self.outbound.lock().take();
        true
    }

    fn take_close_frame(&self) -> Option<CloseFrame> {
        self.close_state.lock().frame.take()
    }

    pub(crate) fn abort_writer(&self) {
        if let Some(handle) = self.writer.lock().take() {
            handle.abort();
        }
        self.writer_done.cancel();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Write task
// ─────────────────────────────────────────────────────────────────────────────

async fn write_loop<K: MessageSink>(session: Arc<Session>, mut sink: K, mut outbound: mpsc::Receiver<Bytes>) {
    let config = session.config;
    let period = config.ping_interval.max(Duration::from_millis(1));
    let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The keepalive is polled ahead of the queue so pings keep going out
    // while the queue never drains.
    loop {
        tokio::select! {
            biased;
            _ = session.lifecycle.cancelled() => break,
            _ = keepalive.tick() => {
                if let Err(e) = write_bounded(config.write_timeout, sink.send_ping()).await {
                    debug!(session_id = %session.id, "keepalive ping failed: {e}");
                    session.begin_close(CloseCause::TransportError, None);
                    break;
                }
            }
            next = outbound.recv() => {
                let Some(frame) = next else { break };
                if let Err(e) = write_bounded(config.write_timeout, sink.send_binary(frame)).await {
                    debug!(session_id = %session.id, "write failed: {e}");
                    session.begin_close(CloseCause::TransportError, None);
                    break;
                }
            }
        }
    }

    if let Some(frame) = session.take_close_frame() {
        if let Err(e) = write_bounded(config.close_grace, sink.send_close(frame)).await {
            debug!(session_id = %session.id, "close frame not delivered: {e}");
        }
    }
    if tokio::time::timeout(config.close_grace, sink.shutdown()).await.is_err() {
        debug!(session_id = %session.id, "transport shutdown timed out");
    }
    session.writer_done.cancel();
}

async fn write_bounded<F>(limit: Duration, write: F) -> Result<(), TransportError>
where
    F: Future<Output = Result<(), TransportError>>,
{
    match tokio::time::timeout(limit, write).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write deadline exceeded",
        ))),
    }
}
