//! Command router: dispatches decoded frames to handlers.
//!
//! Binary handlers are keyed by command id. The reserved RPC id carries a
//! JSON-RPC 2.0 request which is answered on the same id. Every dispatch
//! runs in its own task so a slow handler never stalls the read loop.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use cmdwire_protocol::{
    CMD_RPC, HandlerResult, Params, RequestId, RpcError, RpcRequest, RpcResponse, is_reserved,
};
use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::ServerError;
use crate::session::Session;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Handler for a binary command. Receives the session and the payload.
pub type CommandHandler = Arc<dyn Fn(Arc<Session>, Bytes) -> BoxFuture<()> + Send + Sync>;

/// Handler for a JSON-RPC method. Receives the named params (empty when absent).
pub type RpcHandler = Arc<dyn Fn(Params) -> BoxFuture<HandlerResult> + Send + Sync>;

#[derive(Default)]
pub struct CommandRouter {
    handlers: DashMap<u32, CommandHandler>,
    rpc_handlers: DashMap<String, RpcHandler>,
    unhandled: AtomicU64,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binary command handler, replacing any previous one.
    /// Reserved ids are refused.
    pub fn register_handler<F, Fut>(&self, command_id: u32, handler: F) -> Result<(), ServerError>
    where
        F: Fn(Arc<Session>, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if is_reserved(command_id) {
            return Err(ServerError::ReservedCommand(command_id));
        }
        let handler: CommandHandler = Arc::new(move |session, payload| Box::pin(handler(session, payload)));
        self.handlers.insert(command_id, handler);
        Ok(())
    }

    /// Register a JSON-RPC method handler, replacing any previous one.
    pub fn register_rpc_handler<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: RpcHandler = Arc::new(move |params| Box::pin(handler(params)));
        self.rpc_handlers.insert(method.into(), handler);
    }

    pub fn has_handler(&self, command_id: u32) -> bool {
        self.handlers.contains_key(&command_id)
    }

    pub fn has_rpc_method(&self, method: &str) -> bool {
        self.rpc_handlers.contains_key(method)
    }

    /// Frames dropped because no handler was registered for their id.
    pub fn unhandled_count(&self) -> u64 {
        self.unhandled.load(Ordering::Relaxed)
    }

    /// Route one decoded frame. Returns the spawned handler task, or `None`
    /// when the frame was dropped.
    pub fn dispatch(
        self: &Arc<Self>,
        session: Arc<Session>,
        command_id: u32,
        payload: Bytes,
    ) -> Option<JoinHandle<()>> {
        if command_id == CMD_RPC {
            let router = self.clone();
            return Some(tokio::spawn(async move {
                router.handle_rpc(&session, &payload).await;
            }));
        }

        let Some(handler) = self.handlers.get(&command_id).map(|h| h.value().clone()) else {
            self.unhandled.fetch_add(1, Ordering::Relaxed);
            debug!(session_id = %session.id(), command_id, "no handler for command");
            return None;
        };

        Some(tokio::spawn(async move {
            let session_id = session.id().to_string();
            if AssertUnwindSafe(handler(session, payload)).catch_unwind().await.is_err() {
                error!(session_id = %session_id, command_id, "command handler panicked");
            }
        }))
    }

    // ─────────────────────────────────────────────────────────────────────
    // JSON-RPC bridge
    // ─────────────────────────────────────────────────────────────────────

    async fn handle_rpc(&self, session: &Session, payload: &[u8]) {
        let response = self.rpc_response(payload).await;
        let body = match serde_json::to_vec(&response) {
            Ok(body) => body,
            Err(e) => {
                error!(session_id = %session.id(), "failed to serialize RPC response: {e}");
                return;
            }
        };
        if let Err(e) = session.send(CMD_RPC, &body).await {
            warn!(session_id = %session.id(), "failed to send RPC response: {e}");
        }
    }

    /// Build the response for one RPC payload.
    pub async fn rpc_response(&self, payload: &[u8]) -> RpcResponse {
        let value: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                debug!("RPC parse error: {e}");
                return RpcResponse::error(None, RpcError::parse_error());
            }
        };

        // Recover the id before validating so a malformed request still
        // gets a correlated error.
        let id: Option<RequestId> = value
            .get("id")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());

        let request = match serde_json::from_value::<RpcRequest>(value) {
            Ok(req) if req.is_valid() => req,
            _ => return RpcResponse::error(id, RpcError::invalid_request()),
        };

        let Some(handler) = self.rpc_handlers.get(&request.method).map(|h| h.value().clone()) else {
            debug!(method = %request.method, "RPC method not found");
            return RpcResponse::error(request.id, RpcError::method_not_found());
        };

        let params = request.params.unwrap_or_default();
        match AssertUnwindSafe(handler(params)).catch_unwind().await {
            Ok(Ok(result)) => RpcResponse::success(request.id, result),
            Ok(Err(e)) => RpcResponse::error(request.id, into_rpc_error(e)),
            Err(_) => {
                error!(method = %request.method, "RPC handler panicked");
                RpcResponse::error(request.id, RpcError::internal("handler panicked"))
            }
        }
    }
}

/// Keep a handler's own `RpcError`; anything else becomes an internal error.
fn into_rpc_error(err: Box<dyn std::error::Error + Send + Sync>) -> RpcError {
    match err.downcast::<RpcError>() {
        Ok(rpc) => *rpc,
        Err(other) => RpcError::internal(other.to_string()),
    }
}
