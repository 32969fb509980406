//! Reserved command ids and standard message strings.

/// Command id carrying JSON-RPC 2.0 requests and responses.
pub const CMD_RPC: u32 = 0xFFFF_FFFF;

/// Command id reserved for JSON-RPC error envelopes.
pub const CMD_RPC_ERROR: u32 = 0xFFFF_FFFE;

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Whether `command_id` belongs to the reserved range.
pub fn is_reserved(command_id: u32) -> bool {
    command_id == CMD_RPC || command_id == CMD_RPC_ERROR
}

/// Message strings shared by the server and its peers.
pub mod messages {
    pub const INVALID_MESSAGE_FORMAT: &str = "Invalid message format";
    pub const RATE_LIMIT_EXCEEDED: &str = "Rate limit exceeded";
    pub const SERVER_SHUTTING_DOWN: &str = "Server shutting down";

    pub const PARSE_ERROR: &str = "Parse error";
    pub const INVALID_REQUEST: &str = "Invalid Request";
    pub const METHOD_NOT_FOUND: &str = "Method not found";
    pub const INVALID_PARAMS: &str = "Invalid params";
    pub const INTERNAL_ERROR: &str = "Internal error";
}
