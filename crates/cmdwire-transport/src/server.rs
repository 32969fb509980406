//! WebSocket listener using Axum.
//!
//! Binds the listen address, upgrades requests on the configured path and
//! hands each upgraded connection to a [`ConnectionHandler`]. The listener
//! knows nothing about frames or sessions.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use cmdwire_protocol::{HEADER_SIZE, MAX_PAYLOAD_SIZE};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::connection::{TransportError, Upgraded};
use crate::websocket::{self, WsSink, WsSource};

/// Implemented by the session engine to take ownership of upgraded connections.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Decide whether to upgrade a request. Rejected requests get `403`.
    fn accept(&self, _headers: &HeaderMap, _remote_addr: SocketAddr) -> bool {
        true
    }

    /// Drive a connection until it ends.
    fn handle_connection(&self, conn: Upgraded<WsSource, WsSink>) -> impl Future<Output = ()> + Send;
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Hostname or IP to bind to
    pub hostname: String,
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Upgrade path
    pub path: String,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
    /// Largest transport message accepted from a peer
    pub max_message_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".into(),
            port: 8080,
            path: "/ws".into(),
            max_connections: None,
            max_message_size: HEADER_SIZE + MAX_PAYLOAD_SIZE,
        }
    }
}

struct AppState<H: ConnectionHandler> {
    handler: Arc<H>,
    config: TransportConfig,
    connection_count: Arc<AtomicUsize>,
}

/// A bound, running listener.
pub struct TransportServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
    local_addr: SocketAddr,
    connection_count: Arc<AtomicUsize>,
}

impl TransportServer {
    /// Bind and start serving. Returns only once the listener is bound, so a
    /// bind failure is reported here rather than from a background task.
    pub async fn start<H: ConnectionHandler>(
        config: TransportConfig,
        handler: Arc<H>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind((config.hostname.as_str(), config.port))
            .await
            .map_err(|source| TransportError::Bind {
                addr: format!("{}:{}", config.hostname, config.port),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let connection_count = Arc::new(AtomicUsize::new(0));

        info!("cmdwire transport listening on ws://{local_addr}{}", config.path);

        let state = Arc::new(AppState {
            handler,
            config: config.clone(),
            connection_count: connection_count.clone(),
        });

        let app = Router::new()
            .route(&config.path, get(ws_upgrade_handler::<H>))
            .route("/health", get(health_handler::<H>))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await;
            if let Err(e) = result {
                error!("transport server error: {e}");
            }
        });

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            local_addr,
            connection_count,
        })
    }

    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Upgraded connections whose handler has not yet returned.
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Stop accepting and wait for the listener task, bounded by `deadline`.
    /// On timeout the task is aborted.
    pub async fn stop(&mut self, deadline: Duration) -> Result<(), TransportError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        match tokio::time::timeout(deadline, &mut handle).await {
            Ok(_) => {
                info!("cmdwire transport stopped");
                Ok(())
            }
            Err(_) => {
                handle.abort();
                warn!("transport listener did not stop within {deadline:?}, aborted");
                Err(TransportError::ShutdownTimedOut)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler<H: ConnectionHandler>(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<Arc<AppState<H>>>,
) -> Response {
    if !state.handler.accept(&headers, remote_addr) {
        debug!(%remote_addr, "upgrade refused");
        return StatusCode::FORBIDDEN.into_response();
    }

    if let Some(max) = state.config.max_connections {
        let current = state.connection_count.load(Ordering::Relaxed);
        if current >= max {
            warn!("Connection rejected: max connections reached ({max})");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }

    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            state.connection_count.fetch_add(1, Ordering::Relaxed);
            let (source, sink) = websocket::split(socket);
            state
                .handler
                .handle_connection(Upgraded {
                    source,
                    sink,
                    remote_addr,
                })
                .await;
            state.connection_count.fetch_sub(1, Ordering::Relaxed);
        })
        .into_response()
}

async fn health_handler<H: ConnectionHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.connection_count.load(Ordering::Relaxed),
    }))
}
