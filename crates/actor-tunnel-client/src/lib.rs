//! Actor tunnel client - Public API
//!
//! Keeps one outbound WebSocket to the gateway and multiplexes every HTTP
//! request and WebSocket session for the runner's actors over it. Handlers
//! see ordinary `http` requests and a WebSocket-like adapter; the tunnel
//! stays invisible to them.

pub mod adapter;
pub mod body;
pub mod client;
pub mod config;
mod dispatch;
pub mod error;
pub mod handler;
pub mod reconnect;
mod registry;
pub mod transport;

pub use adapter::{
    BinaryType, CloseEvent, ErrorEvent, EventType, ListenerId, MessageData, OutboundMessage,
    ReadyState, WebSocketAdapter, WebSocketEvent,
};
pub use body::{Body, BodySender};
pub use client::{ConnectionState, TunnelClient};
pub use config::{TunnelConfig, TunnelConfigBuilder};
pub use error::{HandlerError, TransportError, TunnelError};
pub use handler::{ConnectionListener, FetchHandler, TunnelHandlers, WebSocketHandler};
pub use reconnect::{ReconnectConfig, ReconnectManager};
pub use transport::{TunnelConnector, TunnelSocket, WebSocketConnector};

pub use actor_tunnel_proto::Headers;
