//! Server orchestrator.
//!
//! Owns the listener, the router and the registry. Each upgraded connection
//! becomes a session driven by a read loop here; the session's own write
//! task handles everything outbound.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use bytes::Bytes;
use cmdwire_protocol::{HandlerResult, Params, decode_shared, messages};
use cmdwire_transport::{
    CloseFrame, ConnectionHandler, Inbound, MessageSink, MessageSource, TransportServer, Upgraded,
    WsSink, WsSource, close_code,
};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::rate_limit::RateLimiter;
use crate::registry::SessionRegistry;
use crate::router::CommandRouter;
use crate::session::{CloseCause, Session};

pub type ConnectCallback = Arc<dyn Fn(Arc<Session>) + Send + Sync>;

/// Called once per session with `voluntary == true` only when the peer
/// closed the connection itself.
pub type DisconnectCallback = Arc<dyn Fn(Arc<Session>, bool) + Send + Sync>;

/// Decides which upgrade requests are accepted, from their headers.
#[derive(Clone)]
pub struct AcceptPolicy(Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>);

impl AcceptPolicy {
    pub fn new(check: impl Fn(&HeaderMap) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(check))
    }

    pub fn allow_all() -> Self {
        Self::new(|_| true)
    }

    /// Accept requests whose `Origin` header is in `origins`, and requests
    /// without an `Origin` header.
    pub fn allow_origins<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let origins: Vec<String> = origins.into_iter().map(Into::into).collect();
        Self::new(move |headers| match headers.get(axum::http::header::ORIGIN) {
            None => true,
            Some(origin) => origin
                .to_str()
                .map(|o| origins.iter().any(|allowed| allowed == o))
                .unwrap_or(false),
        })
    }

    pub fn check(&self, headers: &HeaderMap) -> bool {
        (self.0)(headers)
    }
}

impl Default for AcceptPolicy {
    fn default() -> Self {
        Self::allow_all()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
}

enum RunState {
    Stopped,
    Starting,
    Running(TransportServer),
}

/// Puts the server back to stopped if `start` never reaches running,
/// including when its future is dropped mid-bind.
struct StartingGuard<'a>(&'a Mutex<RunState>);

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        let mut run = self.0.lock();
        if matches!(*run, RunState::Starting) {
            *run = RunState::Stopped;
        }
    }
}

/// State shared with every connection.
struct Shared {
    config: ServerConfig,
    router: Arc<CommandRouter>,
    registry: Arc<SessionRegistry>,
    on_connect: Option<ConnectCallback>,
    on_disconnect: Option<DisconnectCallback>,
    accept_policy: AcceptPolicy,
}

pub struct Server {
    shared: Arc<Shared>,
    run: Mutex<RunState>,
}

pub struct ServerBuilder {
    config: ServerConfig,
    on_connect: Option<ConnectCallback>,
    on_disconnect: Option<DisconnectCallback>,
    accept_policy: AcceptPolicy,
}

impl ServerBuilder {
    pub fn on_connect(mut self, callback: impl Fn(Arc<Session>) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    pub fn on_disconnect(mut self, callback: impl Fn(Arc<Session>, bool) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(callback));
        self
    }

    pub fn accept_policy(mut self, policy: AcceptPolicy) -> Self {
        self.accept_policy = policy;
        self
    }

    pub fn build(self) -> Server {
        Server {
            shared: Arc::new(Shared {
                config: self.config,
                router: Arc::new(CommandRouter::new()),
                registry: Arc::new(SessionRegistry::new()),
                on_connect: self.on_connect,
                on_disconnect: self.on_disconnect,
                accept_policy: self.accept_policy,
            }),
            run: Mutex::new(RunState::Stopped),
        }
    }
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder {
            config,
            on_connect: None,
            on_disconnect: None,
            accept_policy: AcceptPolicy::default(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn router(&self) -> Arc<CommandRouter> {
        self.shared.router.clone()
    }

    /// Shared handle to the live sessions, usable from handlers.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.shared.registry.clone()
    }

    pub fn register_handler<F, Fut>(&self, command_id: u32, handler: F) -> Result<(), ServerError>
    where
        F: Fn(Arc<Session>, Bytes) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.shared.router.register_handler(command_id, handler)
    }

    pub fn register_rpc_handler<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.shared.router.register_rpc_handler(method, handler)
    }

    pub fn state(&self) -> ServerState {
        match &*self.run.lock() {
            RunState::Stopped => ServerState::Stopped,
            RunState::Starting => ServerState::Starting,
            RunState::Running(_) => ServerState::Running,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Bound listen address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.run.lock() {
            RunState::Running(transport) => Some(transport.local_addr()),
            _ => None,
        }
    }

    pub fn session_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.shared.registry.get(id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Bind and start accepting connections. Returns once the listener is
    /// bound; on failure the server is back in the stopped state.
    pub async fn start(&self) -> Result<(), ServerError> {
        {
            let mut run = self.run.lock();
            if !matches!(*run, RunState::Stopped) {
                return Err(ServerError::AlreadyRunning);
            }
            *run = RunState::Starting;
        }
        let _starting = StartingGuard(&self.run);

        let transport = TransportServer::start(self.shared.config.transport.clone(), self.shared.clone()).await?;
        info!(addr = %transport.local_addr(), "cmdwire server started");
        *self.run.lock() = RunState::Running(transport);
        Ok(())
    }

    /// Close every session with "going away", then stop the listener. The
    /// whole shutdown is bounded by `deadline`; sessions that do not finish
    /// in time have their writers aborted.
    pub async fn stop(&self, deadline: Duration) -> Result<(), ServerError> {
        let mut transport = {
            let mut run = self.run.lock();
            match std::mem::replace(&mut *run, RunState::Stopped) {
                RunState::Running(transport) => transport,
                other => {
                    *run = other;
                    return Ok(());
                }
            }
        };
        let started = Instant::now();
        let sessions = self.shared.registry.snapshot();

        let frame = CloseFrame::new(close_code::GOING_AWAY, messages::SERVER_SHUTTING_DOWN);
        let closed = tokio::time::timeout(
            deadline,
            self.shared.registry.close_all(CloseCause::ServerShutdown, frame),
        )
        .await;

        let mut timed_out = closed.is_err();
        if timed_out {
            let stragglers: Vec<_> = sessions.iter().filter(|s| s.is_alive()).collect();
            warn!(count = stragglers.len(), "sessions did not close within {deadline:?}, aborting");
            for session in stragglers {
                session.abort_writer();
            }
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        if let Err(e) = transport.stop(remaining).await {
            debug!("listener stop: {e}");
            timed_out = true;
        }

        info!("cmdwire server stopped");
        if timed_out {
            Err(ServerError::ShutdownTimedOut)
        } else {
            Ok(())
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Outbound
    // ─────────────────────────────────────────────────────────────────────

    /// Queue a frame on every live session. Returns how many accepted it.
    pub async fn broadcast_command(&self, command_id: u32, payload: &[u8]) -> Result<usize, ServerError> {
        self.shared.registry.broadcast(command_id, payload).await
    }

    pub async fn send_to(&self, session_id: &str, command_id: u32, payload: &[u8]) -> Result<(), ServerError> {
        self.shared.registry.send_to(session_id, command_id, payload).await
    }

    /// Drive an already-established connection to completion. The listener
    /// uses this for every upgrade; other transports may call it directly.
    pub async fn serve_connection<S, K>(&self, conn: Upgraded<S, K>)
    where
        S: MessageSource,
        K: MessageSink,
    {
        self.shared.run_connection(conn).await
    }
}

impl ConnectionHandler for Shared {
    fn accept(&self, headers: &HeaderMap, remote_addr: SocketAddr) -> bool {
        let accepted = self.accept_policy.check(headers);
        if !accepted {
            warn!(%remote_addr, "connection refused by accept policy");
        }
        accepted
    }

    async fn handle_connection(&self, conn: Upgraded<WsSource, WsSink>) {
        self.run_connection(conn).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection lifecycle
// ─────────────────────────────────────────────────────────────────────────────

impl Shared {
    async fn run_connection<S, K>(&self, conn: Upgraded<S, K>)
    where
        S: MessageSource,
        K: MessageSink,
    {
        let Upgraded {
            mut source,
            sink,
            remote_addr,
        } = conn;

        let session = Session::spawn(remote_addr.to_string(), sink, self.config.session);
        self.registry.insert(session.clone());
        info!(session_id = %session.id(), %remote_addr, "session connected");
        if let Some(on_connect) = &self.on_connect {
            on_connect(session.clone());
        }

        let ended = self.read_loop(&session, &mut source).await;

        // Draining
        let cause = session.close_cause().unwrap_or(ended);
        if let Some(on_disconnect) = &self.on_disconnect {
            on_disconnect(session.clone(), cause.is_voluntary());
        }
        self.registry.remove(session.id());
        session.close_with(cause, CloseFrame::normal()).await;
        info!(session_id = %session.id(), ?cause, "session disconnected");
    }

    async fn read_loop<S: MessageSource>(&self, session: &Arc<Session>, source: &mut S) -> CloseCause {
        let mut limiter = RateLimiter::new(&self.config.rate_limit);

        loop {
            let next = tokio::select! {
                biased;
                _ = session.cancelled() => {
                    return session.close_cause().unwrap_or(CloseCause::Local);
                }
                next = tokio::time::timeout(self.config.read_timeout, source.next_message()) => next,
            };

            let data = match next {
                Err(_) => {
                    debug!(session_id = %session.id(), "read deadline exceeded");
                    return CloseCause::ReadTimeout;
                }
                Ok(None) => return CloseCause::PeerClosed,
                Ok(Some(Err(e))) => {
                    debug!(session_id = %session.id(), "read failed: {e}");
                    return CloseCause::TransportError;
                }
                Ok(Some(Ok(message))) => match message {
                    Inbound::Binary(data) => Some(data),
                    Inbound::Text(_) => None,
                    // Any inbound traffic resets the read deadline
                    Inbound::Ping | Inbound::Pong => continue,
                    Inbound::Close(frame) => {
                        debug!(session_id = %session.id(), ?frame, "peer closed");
                        return CloseCause::PeerClosed;
                    }
                },
            };

            if !limiter.try_acquire() {
                warn!(
                    session_id = %session.id(),
                    remote_addr = %session.remote_addr(),
                    "rate limit exceeded, closing session"
                );
                let frame = CloseFrame::new(close_code::POLICY_VIOLATION, messages::RATE_LIMIT_EXCEEDED);
                session.close_with(CloseCause::RateLimited, frame).await;
                return CloseCause::RateLimited;
            }

            let Some(data) = data else {
                debug!(session_id = %session.id(), "text message on binary protocol");
                return self.protocol_violation(session).await;
            };
            match decode_shared(data) {
                Ok((command_id, payload)) => {
                    self.router.dispatch(session.clone(), command_id, payload);
                }
                Err(e) => {
                    debug!(session_id = %session.id(), "malformed frame: {e}");
                    return self.protocol_violation(session).await;
                }
            }
        }
    }

    async fn protocol_violation(&self, session: &Session) -> CloseCause {
        let frame = CloseFrame::new(close_code::PROTOCOL_ERROR, messages::INVALID_MESSAGE_FORMAT);
        session.close_with(CloseCause::ProtocolError, frame).await;
        CloseCause::ProtocolError
    }
}
