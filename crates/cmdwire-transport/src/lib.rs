//! cmdwire transport layer
//!
//! Accepts WebSocket upgrades and exposes each connection as a pair of
//! message halves ([`MessageSource`], [`MessageSink`]). The session engine
//! plugs in through [`ConnectionHandler`]; an in-memory pair in [`mem`]
//! stands in for a socket.

pub mod connection;
pub mod mem;
pub mod server;
pub mod websocket;

pub use connection::{
    CloseFrame, Inbound, MessageSink, MessageSource, TransportError, Upgraded, close_code,
};
pub use server::{ConnectionHandler, TransportConfig, TransportServer};
pub use websocket::{WsSink, WsSource};
