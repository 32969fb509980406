//! cmdwire server: the session engine.
//!
//! Accepted connections become [`Session`]s. Inbound frames are rate limited,
//! decoded and routed by [`CommandRouter`]; the reserved RPC command id is
//! bridged to JSON-RPC method handlers. [`Server`] ties the listener, the
//! [`SessionRegistry`] and the router together and owns the lifecycle.

pub mod config;
pub mod error;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;

pub use config::{ServerConfig, SessionConfig};
pub use error::{ServerError, SessionError};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use registry::SessionRegistry;
pub use router::{CommandHandler, CommandRouter, RpcHandler};
pub use server::{AcceptPolicy, ConnectCallback, DisconnectCallback, Server, ServerBuilder, ServerState};
pub use session::{CloseCause, Session};
