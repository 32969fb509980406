use cmdwire_protocol::FrameError;
use cmdwire_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] FrameError),

    #[error("session connection is closed")]
    ConnectionClosed,

    #[error("send deadline exceeded")]
    DeadlineExceeded,

    #[error("send cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server already running")]
    AlreadyRunning,

    #[error("command id {0:#010x} is reserved")]
    ReservedCommand(u32),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("shutdown did not complete within the deadline")]
    ShutdownTimedOut,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Session(#[from] SessionError),
}
