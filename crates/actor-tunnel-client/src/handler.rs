//! Capability interfaces injected by the actor runtime

use async_trait::async_trait;
use http::{Request, Response};
use std::future::Future;
use std::sync::Arc;

use crate::adapter::WebSocketAdapter;
use crate::body::Body;
use crate::error::HandlerError;

/// Serves HTTP requests addressed to a local actor
#[async_trait]
pub trait FetchHandler: Send + Sync + 'static {
    /// A returned error is answered with `500 Internal Server Error`
    async fn fetch(
        &self,
        actor_id: String,
        request: Request<Body>,
    ) -> Result<Response<Body>, HandlerError>;
}

#[async_trait]
impl<F, Fut> FetchHandler for F
where
    F: Fn(String, Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Body>, HandlerError>> + Send + 'static,
{
    async fn fetch(
        &self,
        actor_id: String,
        request: Request<Body>,
    ) -> Result<Response<Body>, HandlerError> {
        (self)(actor_id, request).await
    }
}

/// Takes over tunneled WebSocket sessions addressed to a local actor.
///
/// The adapter is already open when the handler runs. The handler owns it
/// for the lifetime of the session; returning does not close it.
#[async_trait]
pub trait WebSocketHandler: Send + Sync + 'static {
    async fn websocket(
        &self,
        actor_id: String,
        websocket: WebSocketAdapter,
        request: Request<()>,
    ) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> WebSocketHandler for F
where
    F: Fn(String, WebSocketAdapter, Request<()>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn websocket(
        &self,
        actor_id: String,
        websocket: WebSocketAdapter,
        request: Request<()>,
    ) -> Result<(), HandlerError> {
        (self)(actor_id, websocket, request).await
    }
}

/// Tunnel connection lifecycle notifications
pub trait ConnectionListener: Send + Sync + 'static {
    fn on_connected(&self) {}

    fn on_disconnected(&self) {}
}

/// Handlers installed with [`crate::TunnelClient::set_handlers`]
#[derive(Clone)]
pub struct TunnelHandlers {
    pub(crate) fetch: Arc<dyn FetchHandler>,
    pub(crate) websocket: Option<Arc<dyn WebSocketHandler>>,
    pub(crate) connection: Option<Arc<dyn ConnectionListener>>,
}

impl TunnelHandlers {
    pub fn new(fetch: impl FetchHandler) -> Self {
        Self {
            fetch: Arc::new(fetch),
            websocket: None,
            connection: None,
        }
    }

    /// Accept tunneled WebSockets. Without one, opens are refused.
    pub fn with_websocket(mut self, websocket: impl WebSocketHandler) -> Self {
        self.websocket = Some(Arc::new(websocket));
        self
    }

    pub fn with_connection_listener(mut self, listener: impl ConnectionListener) -> Self {
        self.connection = Some(Arc::new(listener));
        self
    }

    pub(crate) fn on_connected(&self) {
        if let Some(listener) = &self.connection {
            listener.on_connected();
        }
    }

    pub(crate) fn on_disconnected(&self) {
        if let Some(listener) = &self.connection {
            listener.on_disconnected();
        }
    }
}

impl std::fmt::Debug for TunnelHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandlers")
            .field("websocket", &self.websocket.is_some())
            .field("connection", &self.connection.is_some())
            .finish()
    }
}
