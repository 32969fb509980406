//! cmdwire protocol types
//!
//! Binary command framing plus the JSON-RPC 2.0 envelope that rides on the
//! reserved RPC command id. This crate is the single source of truth for the
//! wire format, reserved command ids, and error codes.

pub mod commands;
pub mod error;
pub mod frame;
pub mod jsonrpc;

pub use commands::{CMD_RPC, CMD_RPC_ERROR, JSONRPC_VERSION, is_reserved, messages};
pub use error::{RpcError, RpcErrorCode};
pub use frame::{FrameError, HEADER_SIZE, MAX_PAYLOAD_SIZE, decode, decode_shared, encode};
pub use jsonrpc::{
    HandlerResult, Params, RequestId, RpcErrorResponse, RpcRequest, RpcResponse,
    RpcSuccessResponse,
};
