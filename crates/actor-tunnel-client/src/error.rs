//! Error types for the tunnel client

use actor_tunnel_proto::CodecError;
use thiserror::Error;

/// Error returned by injected `fetch`/`websocket` handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Tunnel client errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The tunnel was shut down deliberately
    #[error("Tunnel shutting down")]
    ShuttingDown,

    /// The owning actor was unregistered while the request was in flight
    #[error("Actor {0} stopped")]
    ActorStopped(String),

    #[error("Request aborted")]
    Aborted,

    #[error("Response aborted")]
    ResponseAborted,

    #[error("Tunnel not connected")]
    NotConnected,

    #[error("Message acknowledgment timeout")]
    AckTimeout,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("WebSocket is not open")]
    WebSocketNotOpen,

    #[error("{0} not supported in tunnel adapter")]
    Unsupported(&'static str),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl TunnelError {
    /// Whether the error comes from a deliberate stop rather than a failure
    pub fn is_deliberate_stop(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::ActorStopped(_))
    }
}

/// Transport errors raised while establishing the physical connection
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid tunnel URL: {0}")]
    InvalidUrl(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection timed out after {0:?}")]
    Timeout(std::time::Duration),
}
