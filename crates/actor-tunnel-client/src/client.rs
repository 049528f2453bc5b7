//! Tunnel client: connection lifecycle and the public API

use bytes::Bytes;
use http::{Request, Response};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use actor_tunnel_proto::{
    BodyChunk, Envelope, Headers, MessageKind, RequestId, StreamFinishReason,
    ToServerRequestStart, WebSocketOpen,
};

use crate::adapter::{WebSocketAdapter, CLOSE_NORMAL};
use crate::body::Body;
use crate::config::TunnelConfig;
use crate::dispatch::headers_from_map;
use crate::error::TunnelError;
use crate::handler::TunnelHandlers;
use crate::reconnect::ReconnectManager;
use crate::registry::{Direction, Evicted, PendingRequest, Registry};
use crate::transport::{TunnelConnector, TunnelSocket, WebSocketConnector};

/// Connection state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ShutDown,
}

struct Connection {
    state: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    driver: Option<JoinHandle<()>>,
}

pub(crate) struct ClientInner {
    pub(crate) config: TunnelConfig,
    connector: Arc<dyn TunnelConnector>,
    registry: Mutex<Registry>,
    handlers: RwLock<Option<TunnelHandlers>>,
    connection: Mutex<Connection>,
    pub(crate) shutdown: CancellationToken,
}

/// Multiplexes local actors' HTTP and WebSocket traffic over one
/// connection to the gateway.
///
/// Cloning yields another handle to the same tunnel.
#[derive(Clone)]
pub struct TunnelClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for TunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelClient")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .finish()
    }
}

impl TunnelClient {
    pub fn new(config: TunnelConfig) -> Self {
        let connector = WebSocketConnector::new(&config);
        Self::with_connector(config, connector)
    }

    /// Use a custom connector instead of a real WebSocket
    pub fn with_connector(config: TunnelConfig, connector: impl TunnelConnector) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                connector: Arc::new(connector),
                registry: Mutex::new(Registry::new()),
                handlers: RwLock::new(None),
                connection: Mutex::new(Connection {
                    state: ConnectionState::Disconnected,
                    outbound: None,
                    driver: None,
                }),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start connecting in the background. Does nothing if the tunnel is
    /// already running or has been shut down.
    pub fn start(&self) {
        if self.inner.shutdown.is_cancelled() {
            warn!("Tunnel already shut down, not starting");
            return;
        }

        let mut connection = self.inner.connection();
        if let Some(driver) = &connection.driver {
            if !driver.is_finished() {
                debug!("Tunnel already started");
                return;
            }
        }

        info!("Starting tunnel to {}", self.inner.config.url);
        connection.driver = Some(tokio::spawn(self.inner.clone().run()));
    }

    /// Stop the tunnel for good.
    ///
    /// Every in-flight request fails with [`TunnelError::ShuttingDown`],
    /// every WebSocket adapter is closed and all actors are forgotten.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down tunnel");

        // The driver drops the outbound sender once cancelled, so evict
        // first for the abort and close frames to reach the gateway.
        let evicted = self.inner.registry().drain();
        self.inner
            .evict(evicted, || TunnelError::ShuttingDown, "Tunnel shutting down");

        self.inner.shutdown.cancel();
        {
            let mut connection = self.inner.connection();
            connection.state = ConnectionState::ShutDown;
            connection.outbound = None;
        }

        // Anything registered while the first eviction ran
        let late = self.inner.registry().drain();
        self.inner
            .evict(late, || TunnelError::ShuttingDown, "Tunnel shutting down");
    }

    pub fn set_handlers(&self, handlers: TunnelHandlers) {
        *self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handlers);
    }

    /// Accept traffic for `actor_id`
    pub fn register_actor(&self, actor_id: impl Into<String>) {
        let actor_id = actor_id.into();
        if self.inner.shutdown.is_cancelled() {
            warn!("Tunnel shut down, not registering actor {}", actor_id);
            return;
        }
        if self.inner.registry().register_actor(&actor_id) {
            info!("Registered actor {}", actor_id);
        } else {
            debug!("Actor {} already registered", actor_id);
        }
    }

    /// Stop accepting traffic for `actor_id`.
    ///
    /// Its in-flight requests fail with [`TunnelError::ActorStopped`] and
    /// its WebSockets are closed with code 1000.
    pub fn unregister_actor(&self, actor_id: &str) {
        let Some(evicted) = self.inner.registry().unregister_actor(actor_id) else {
            debug!("Actor {} is not registered", actor_id);
            return;
        };

        info!(
            "Unregistered actor {} ({} requests, {} websockets)",
            actor_id,
            evicted.requests.len(),
            evicted.websockets.len()
        );
        let stopped = actor_id.to_string();
        self.inner.evict(
            evicted,
            || TunnelError::ActorStopped(stopped.clone()),
            "Actor stopped",
        );
    }

    pub fn has_actor(&self, actor_id: &str) -> bool {
        self.inner.registry().has_actor(actor_id)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Requests in flight in either direction
    pub fn pending_requests(&self) -> usize {
        self.inner.registry().pending_requests()
    }

    /// Open WebSocket sessions in either direction
    pub fn active_websockets(&self) -> usize {
        self.inner.registry().active_websockets()
    }

    /// Send an HTTP request to a remote actor through the gateway.
    ///
    /// A streamed request body is forwarded chunk by chunk. The response
    /// resolves once its start frame arrives; a streamed response body
    /// keeps filling afterwards.
    pub async fn fetch(
        &self,
        actor_id: &str,
        request: Request<Body>,
    ) -> Result<Response<Body>, TunnelError> {
        if !self.is_connected() {
            return Err(TunnelError::NotConnected);
        }

        let request_id = RequestId::new();
        let (parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let (tx, rx) = oneshot::channel();
        self.inner
            .registry()
            .insert_request(request_id, PendingRequest::outbound(actor_id, tx));

        let (initial, stream) = match body.try_into_bytes() {
            Ok(bytes) => (bytes, None),
            Err(body) => (None, Some(body)),
        };

        let start = ToServerRequestStart {
            actor_id: actor_id.to_string(),
            method: parts.method.as_str().to_string(),
            path,
            headers: headers_from_map(&parts.headers),
            body: initial,
            stream: stream.is_some(),
        };
        if !self
            .inner
            .send_message(request_id, MessageKind::ToServerRequestStart(start))
        {
            self.inner.registry().remove_request(&request_id);
            return Err(TunnelError::NotConnected);
        }

        let mut abandon = AbandonOnDrop {
            inner: &self.inner,
            request_id,
            armed: true,
        };

        if let Some(body) = stream {
            tokio::spawn(self.inner.clone().forward_request_body(request_id, body));
        }

        let response = rx.await;
        abandon.armed = false;
        response.map_err(|_| TunnelError::ResponseAborted)?
    }

    /// Open a WebSocket to a remote actor through the gateway.
    ///
    /// The adapter starts out connecting and fires its open event once the
    /// gateway confirms the session.
    pub fn open_websocket(
        &self,
        actor_id: &str,
        path: &str,
        headers: Headers,
    ) -> Result<WebSocketAdapter, TunnelError> {
        if !self.is_connected() {
            return Err(TunnelError::NotConnected);
        }

        let request_id = RequestId::new();
        let adapter = self.inner.create_adapter(request_id, Direction::Outbound);
        self.inner
            .registry()
            .insert_websocket(request_id, adapter.clone());

        let open = WebSocketOpen {
            actor_id: actor_id.to_string(),
            path: path.to_string(),
            headers,
        };
        if !self
            .inner
            .send_message(request_id, MessageKind::ToServerWebSocketOpen(open))
        {
            self.inner.registry().remove_websocket(&request_id);
            return Err(TunnelError::NotConnected);
        }

        Ok(adapter)
    }
}

/// Forgets an outbound request whose caller stopped waiting before the
/// response started, and tells the gateway to abort it.
struct AbandonOnDrop<'a> {
    inner: &'a ClientInner,
    request_id: RequestId,
    armed: bool,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let abandoned = self.inner.registry().remove_request(&self.request_id);
        if abandoned.is_some() {
            debug!("Fetch {} dropped before its response", self.request_id);
            self.inner
                .send_message(self.request_id, MessageKind::ToServerRequestAbort);
        }
    }
}

impl ClientInner {
    pub(crate) fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn handlers(&self) -> Option<TunnelHandlers> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, state: ConnectionState) {
        let mut connection = self.connection();
        if connection.state != ConnectionState::ShutDown {
            connection.state = state;
        }
    }

    /// Send a new message for `request_id`. Returns false when not connected.
    pub(crate) fn send_message(&self, request_id: RequestId, kind: MessageKind) -> bool {
        self.send_envelope(Envelope::new(request_id, kind))
    }

    pub(crate) fn send_envelope(&self, envelope: Envelope) -> bool {
        let request_id = envelope.request_id;

        let Some(outbound) = self.connection().outbound.clone() else {
            let tag = envelope.kind.tag();
            if self.shutdown.is_cancelled() {
                debug!("Dropping {:?} for {}, tunnel shut down", tag, request_id);
            } else {
                warn!("Cannot send {:?} for {}, tunnel not connected", tag, request_id);
            }
            return false;
        };

        if self.config.ack_timeout.is_some() && !matches!(envelope.kind, MessageKind::Ack) {
            self.registry()
                .record_message(envelope.message_id, request_id, Instant::now());
        }

        outbound.send(envelope.encode()).is_ok()
    }

    /// Fail evicted requests and close evicted WebSockets
    pub(crate) fn evict<F>(&self, evicted: Evicted, error: F, close_reason: &str)
    where
        F: Fn() -> TunnelError,
    {
        for (request_id, pending) in evicted.requests {
            self.fail_request(request_id, pending, &error);
        }
        for (_, adapter) in evicted.websockets {
            adapter.close(Some(CLOSE_NORMAL), Some(close_reason.to_string()));
        }
    }

    fn fail_request<F>(&self, request_id: RequestId, pending: PendingRequest, error: F)
    where
        F: Fn() -> TunnelError,
    {
        if let Some(task) = pending.task {
            task.abort();
        }
        if let Some(body) = pending.body {
            body.abort(error());
        }
        if let Some(responder) = pending.responder {
            let _ = responder.send(Err(error()));
        }
        if pending.direction == Direction::Inbound {
            self.send_message(request_id, MessageKind::ToClientResponseAbort);
        }
    }

    async fn forward_request_body(self: Arc<Self>, request_id: RequestId, mut body: Body) {
        while let Some(chunk) = body.chunk().await {
            if self.registry().request_mut(&request_id).is_none() {
                debug!("Request {} ended, dropping rest of its body", request_id);
                return;
            }
            match chunk {
                Ok(chunk) => {
                    let chunk = BodyChunk::more(chunk);
                    if !self.send_message(request_id, MessageKind::ToServerRequestChunk(chunk)) {
                        self.fail_unsent_request(request_id);
                        return;
                    }
                }
                Err(e) => {
                    warn!("Request body for {} failed: {}", request_id, e);
                    self.send_message(
                        request_id,
                        MessageKind::request_finish(StreamFinishReason::Aborted),
                    );
                    return;
                }
            }
        }

        if !self.send_message(
            request_id,
            MessageKind::request_finish(StreamFinishReason::Complete),
        ) {
            self.fail_unsent_request(request_id);
        }
    }

    /// The connection dropped while a request body was being sent
    fn fail_unsent_request(&self, request_id: RequestId) {
        let Some(pending) = self.registry().remove_request(&request_id) else {
            return;
        };
        warn!("Connection lost while sending request {}", request_id);
        if let Some(responder) = pending.responder {
            let _ = responder.send(Err(TunnelError::NotConnected));
        }
        if let Some(body) = pending.body {
            body.abort(TunnelError::NotConnected);
        }
    }

    /// Connect, serve, back off, repeat until shut down
    async fn run(self: Arc<Self>) {
        let mut reconnect = ReconnectManager::new(self.config.reconnect.clone());

        loop {
            self.set_state(ConnectionState::Connecting);

            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.connector.connect() => result,
            };

            match connected {
                Ok(socket) => {
                    reconnect.reset();
                    self.serve(socket).await;
                }
                Err(e) => warn!("Failed to connect tunnel: {}", e),
            }

            if self.shutdown.is_cancelled() {
                break;
            }
            self.set_state(ConnectionState::Disconnected);

            let delay = match reconnect.next_delay() {
                Ok(delay) => delay,
                Err(e) => {
                    error!("Giving up on tunnel: {}", e);
                    break;
                }
            };
            info!("Reconnecting tunnel in {}ms", delay.as_millis());

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
        debug!("Tunnel driver stopped");
    }

    async fn serve(self: &Arc<Self>, socket: TunnelSocket) {
        let TunnelSocket {
            sender,
            mut receiver,
        } = socket;

        {
            let mut connection = self.connection();
            if connection.state == ConnectionState::ShutDown {
                return;
            }
            connection.outbound = Some(sender);
            connection.state = ConnectionState::Connected;
        }
        info!("Tunnel connected");

        if let Some(handlers) = self.handlers() {
            handlers.on_connected();
        }

        let gc_interval = self.config.gc_interval;
        let mut gc = interval_at(Instant::now() + gc_interval, gc_interval);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = receiver.recv() => match frame {
                    Some(frame) => self.handle_frame(&frame),
                    None => {
                        info!("Tunnel disconnected");
                        break;
                    }
                },
                _ = gc.tick(), if self.config.ack_timeout.is_some() => self.collect_garbage(),
            }
        }

        self.connection().outbound = None;

        if let Some(handlers) = self.handlers() {
            handlers.on_disconnected();
        }
    }

    fn collect_garbage(&self) {
        let Some(timeout) = self.config.ack_timeout else {
            return;
        };

        let (expired, evicted) = self.registry().expire_messages(Instant::now(), timeout);
        if expired == 0 {
            return;
        }
        if evicted.is_empty() {
            debug!("Dropped {} unacknowledged messages of finished requests", expired);
            return;
        }

        warn!(
            "Purging {} unacknowledged messages ({} requests, {} websockets)",
            expired,
            evicted.requests.len(),
            evicted.websockets.len()
        );
        self.evict(
            evicted,
            || TunnelError::AckTimeout,
            "Message acknowledgment timeout",
        );
    }
}
