//! Session engine configuration.

use std::time::Duration;

use cmdwire_transport::TransportConfig;

use crate::rate_limit::RateLimitConfig;

/// Per-session timing and queue sizing.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Outbound frames queued before `send` blocks
    pub outbound_capacity: usize,
    /// Bound on a single transport write
    pub write_timeout: Duration,
    /// Keepalive ping period
    pub ping_interval: Duration,
    /// Time allowed for the close frame and transport shutdown
    pub close_grace: Duration,
    /// Deadline used by `Session::send`
    pub send_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            write_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(54),
            close_grace: Duration::from_secs(1),
            send_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub transport: TransportConfig,
    pub session: SessionConfig,
    /// Idle time after which a silent peer is dropped. Any inbound message,
    /// pong included, resets it.
    pub read_timeout: Duration,
    pub rate_limit: RateLimitConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            session: SessionConfig::default(),
            read_timeout: Duration::from_secs(60),
            rate_limit: RateLimitConfig::default(),
        }
    }
}
