//! JSON-RPC 2.0 envelope carried under the reserved RPC command id.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::commands::JSONRPC_VERSION;
use crate::error::RpcError;

/// JSON-RPC 2.0 request ID, either a string or a number.
///
/// A missing or `null` id is represented as `Option::None` by the envelope
/// types and serialized back as `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(serde_json::Number),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// Named parameters passed to an RPC handler.
pub type Params = Map<String, Value>;

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    /// Empty when the request carried no method; no handler matches it.
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

/// JSON-RPC 2.0 success response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSuccessResponse {
    pub jsonrpc: String,
    pub result: Value,
    pub id: Option<RequestId>,
}

/// JSON-RPC 2.0 error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorResponse {
    pub jsonrpc: String,
    pub error: RpcError,
    pub id: Option<RequestId>,
}

/// JSON-RPC 2.0 response (success or error).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcResponse {
    Error(RpcErrorResponse),
    Success(RpcSuccessResponse),
}

/// Result returned by an RPC method handler.
pub type HandlerResult = Result<Value, Box<dyn std::error::Error + Send + Sync>>;

// ─────────────────────────────────────────────────────────────────────────────
// Helper constructors
// ─────────────────────────────────────────────────────────────────────────────

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Params>, id: Option<RequestId>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params,
            id,
        }
    }

    /// Validate that this is a well-formed JSON-RPC 2.0 request.
    pub fn is_valid(&self) -> bool {
        self.jsonrpc == JSONRPC_VERSION
    }
}

impl RpcResponse {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self::Success(RpcSuccessResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            result,
            id,
        })
    }

    pub fn error(id: Option<RequestId>, error: RpcError) -> Self {
        Self::Error(RpcErrorResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            error,
            id,
        })
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Success(r) => r.id.as_ref(),
            Self::Error(r) => r.id.as_ref(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}
