//! Frame dispatch: turns inbound tunnel frames into handler calls, caller
//! resolutions and adapter events.
//!
//! Frames are handled one at a time in arrival order. Nothing here awaits;
//! handler work runs on spawned tasks that report back through
//! [`ClientInner::send_message`].

use bytes::Bytes;
use futures_util::FutureExt;
use http::header::{HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, UPGRADE};
use http::{HeaderMap, Request, Response};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use actor_tunnel_proto::{
    BodyChunk, Envelope, Headers, MessageKind, RequestId, ToClientResponseStart,
    ToServerRequestStart, WebSocketClose, WebSocketMessage, WebSocketOpen,
};

use crate::adapter::{WebSocketAdapter, CLOSE_INTERNAL_ERROR};
use crate::body::Body;
use crate::client::ClientInner;
use crate::error::TunnelError;
use crate::handler::TunnelHandlers;
use crate::registry::{Direction, PendingRequest};

impl ClientInner {
    pub(crate) fn handle_frame(self: &Arc<Self>, frame: &[u8]) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("Dropping tunnel frame ({} bytes): {}", frame.len(), e);
                return;
            }
        };

        let Envelope {
            request_id,
            message_id,
            kind,
        } = envelope;
        trace!("Received {:?} for {}", kind.tag(), request_id);

        if let MessageKind::Ack = kind {
            if !self.registry().ack(&message_id) {
                trace!("Ack for untracked message {}", message_id);
            }
            return;
        }
        self.send_envelope(Envelope::ack(request_id, message_id));

        match kind {
            MessageKind::Ack => {}

            MessageKind::ToServerRequestStart(start) => {
                self.handle_request_start(request_id, start)
            }
            MessageKind::ToServerRequestChunk(chunk) => {
                self.handle_body_chunk(request_id, chunk, Direction::Inbound)
            }
            MessageKind::ToServerRequestAbort => self.handle_request_abort(request_id),

            MessageKind::ToClientResponseStart(start) => {
                self.handle_response_start(request_id, start)
            }
            MessageKind::ToClientResponseChunk(chunk) => {
                self.handle_body_chunk(request_id, chunk, Direction::Outbound)
            }
            MessageKind::ToClientResponseAbort => self.handle_response_abort(request_id),

            MessageKind::ToServerWebSocketOpen(open) => {
                self.handle_websocket_open(request_id, open)
            }
            MessageKind::ToClientWebSocketOpen => {
                let adapter = self.registry().websocket(&request_id, Direction::Outbound);
                match adapter {
                    Some(adapter) => adapter.handle_open(),
                    None => debug!("Open for unknown websocket {}", request_id),
                }
            }
            MessageKind::ToServerWebSocketMessage(message) => {
                self.handle_websocket_message(request_id, message, Direction::Inbound)
            }
            MessageKind::ToClientWebSocketMessage(message) => {
                self.handle_websocket_message(request_id, message, Direction::Outbound)
            }
            MessageKind::ToServerWebSocketClose(close) => {
                self.handle_websocket_close(request_id, close, Direction::Inbound)
            }
            MessageKind::ToClientWebSocketClose(close) => {
                self.handle_websocket_close(request_id, close, Direction::Outbound)
            }
        }
    }

    fn handle_request_start(self: &Arc<Self>, request_id: RequestId, start: ToServerRequestStart) {
        let ToServerRequestStart {
            actor_id,
            method,
            path,
            headers,
            body,
            stream,
        } = start;

        if !self.registry().has_actor(&actor_id) {
            warn!("Request {} for unknown actor {}", request_id, actor_id);
            self.send_error_response(request_id, 404, "Actor not found");
            return;
        }

        let Some(handlers) = self.handlers() else {
            warn!("No handlers installed, refusing request {}", request_id);
            self.send_error_response(request_id, 501, "Not Implemented");
            return;
        };

        let (body, body_tx) = if stream {
            let (tx, body_rx) = Body::channel();
            if let Some(initial) = body {
                tx.push(initial);
            }
            (body_rx, Some(tx))
        } else {
            (body.map(Body::full).unwrap_or_default(), None)
        };

        let request = match build_request(&method, &path, &headers, body) {
            Ok(request) => request,
            Err(e) => {
                warn!("Invalid request {} for actor {}: {}", request_id, actor_id, e);
                self.send_error_response(request_id, 400, "Bad Request");
                return;
            }
        };

        let inserted = self
            .registry()
            .insert_actor_request(request_id, PendingRequest::inbound(&actor_id, body_tx));
        if inserted.is_err() {
            if self.registry().has_actor(&actor_id) {
                warn!("Duplicate request id {}, dropping", request_id);
            } else {
                self.send_error_response(request_id, 404, "Actor not found");
            }
            return;
        }

        let task = tokio::spawn(
            self.clone()
                .serve_request(handlers, actor_id, request_id, request),
        );
        self.registry().set_request_task(&request_id, task.abort_handle());
    }

    async fn serve_request(
        self: Arc<Self>,
        handlers: TunnelHandlers,
        actor_id: String,
        request_id: RequestId,
        request: Request<Body>,
    ) {
        let result = AssertUnwindSafe(handlers.fetch.fetch(actor_id.clone(), request))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(response)) => self.send_response(request_id, response).await,
            Ok(Err(e)) => {
                error!(
                    "Error handling request {} for actor {}: {}",
                    request_id, actor_id, e
                );
                self.send_error_response(request_id, 500, "Internal Server Error");
            }
            Err(_) => {
                error!("Handler panicked on request {} for actor {}", request_id, actor_id);
                self.send_error_response(request_id, 500, "Internal Server Error");
            }
        }

        self.registry().remove_request(&request_id);
    }

    /// Buffer the whole response and send it as a single start frame
    async fn send_response(&self, request_id: RequestId, response: Response<Body>) {
        let (parts, body) = response.into_parts();
        let body = match body.collect().await {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to read response body for {}: {}", request_id, e);
                self.send_error_response(request_id, 500, "Internal Server Error");
                return;
            }
        };

        let mut headers = headers_from_map(&parts.headers);
        if !body.is_empty() && !headers.contains_key(CONTENT_LENGTH.as_str()) {
            headers.insert(CONTENT_LENGTH.as_str().to_string(), body.len().to_string());
        }

        let start = ToClientResponseStart {
            status: parts.status.as_u16(),
            headers,
            body: (!body.is_empty()).then_some(body),
            stream: false,
        };
        self.send_message(request_id, MessageKind::ToClientResponseStart(start));
    }

    fn send_error_response(&self, request_id: RequestId, status: u16, message: &'static str) {
        let mut headers = Headers::new();
        headers.insert(CONTENT_TYPE.as_str().to_string(), "text/plain".to_string());

        let start = ToClientResponseStart {
            status,
            headers,
            body: Some(Bytes::from_static(message.as_bytes())),
            stream: false,
        };
        self.send_message(request_id, MessageKind::ToClientResponseStart(start));
    }

    fn handle_body_chunk(&self, request_id: RequestId, chunk: BodyChunk, direction: Direction) {
        let mut registry = self.registry();
        let Some(pending) = registry
            .request_mut(&request_id)
            .filter(|pending| pending.direction == direction)
        else {
            debug!("Chunk for unknown request {}", request_id);
            return;
        };
        let Some(body) = pending.body.as_ref() else {
            debug!("Chunk for request {} without a streamed body", request_id);
            return;
        };

        body.push(chunk.body);
        if !chunk.finish {
            return;
        }

        let finished = pending.body.take();
        if direction == Direction::Outbound {
            registry.remove_request(&request_id);
        }
        drop(registry);
        if let Some(body) = finished {
            body.finish();
        }
    }

    fn handle_request_abort(&self, request_id: RequestId) {
        let mut registry = self.registry();
        let Some(pending) = registry
            .request_mut(&request_id)
            .filter(|pending| pending.direction == Direction::Inbound)
        else {
            debug!("Abort for unknown request {}", request_id);
            return;
        };

        // A handler still reading the body sees the abort as a body error.
        // Otherwise the handler itself is cancelled.
        if let Some(body) = pending.body.take() {
            drop(registry);
            body.abort(TunnelError::Aborted);
            return;
        }

        if let Some(pending) = registry.remove_request(&request_id) {
            drop(registry);
            if let Some(task) = pending.task {
                task.abort();
            }
        }
    }

    fn handle_response_start(&self, request_id: RequestId, start: ToClientResponseStart) {
        let mut registry = self.registry();
        let Some(pending) = registry
            .request_mut(&request_id)
            .filter(|pending| pending.direction == Direction::Outbound)
        else {
            debug!("Response for unknown request {}", request_id);
            return;
        };
        let Some(responder) = pending.responder.take() else {
            debug!("Request {} already has a response", request_id);
            return;
        };

        let ToClientResponseStart {
            status,
            headers,
            body,
            stream,
        } = start;

        let body = if stream {
            let (tx, body_rx) = Body::channel();
            if let Some(initial) = body {
                tx.push(initial);
            }
            pending.body = Some(tx);
            body_rx
        } else {
            registry.remove_request(&request_id);
            body.map(Body::full).unwrap_or_default()
        };
        drop(registry);

        let result = build_response(status, &headers, body)
            .map_err(|e| TunnelError::InvalidRequest(format!("invalid response: {}", e)));
        if result.is_err() {
            self.registry().remove_request(&request_id);
        }
        let _ = responder.send(result);
    }

    fn handle_response_abort(&self, request_id: RequestId) {
        let pending = {
            let mut registry = self.registry();
            let outbound = registry
                .request_mut(&request_id)
                .is_some_and(|pending| pending.direction == Direction::Outbound);
            if outbound {
                registry.remove_request(&request_id)
            } else {
                None
            }
        };
        let Some(pending) = pending else {
            debug!("Abort for unknown response {}", request_id);
            return;
        };

        if let Some(responder) = pending.responder {
            let _ = responder.send(Err(TunnelError::ResponseAborted));
        }
        if let Some(body) = pending.body {
            body.abort(TunnelError::ResponseAborted);
        }
    }

    fn handle_websocket_open(self: &Arc<Self>, request_id: RequestId, open: WebSocketOpen) {
        let WebSocketOpen {
            actor_id,
            path,
            headers,
        } = open;

        if !self.registry().has_actor(&actor_id) {
            warn!("WebSocket {} for unknown actor {}", request_id, actor_id);
            self.reject_websocket(request_id, "Actor not found");
            return;
        }

        let Some(handler) = self.handlers().and_then(|handlers| handlers.websocket) else {
            warn!("No websocket handler installed, refusing {}", request_id);
            self.reject_websocket(request_id, "Not Implemented");
            return;
        };

        let request = match build_upgrade_request(&path, &headers) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    "Invalid websocket request {} for actor {}: {}",
                    request_id, actor_id, e
                );
                self.reject_websocket(request_id, "Server Error");
                return;
            }
        };

        let adapter = self.create_adapter(request_id, Direction::Inbound);
        if !self
            .registry()
            .insert_actor_websocket(request_id, &actor_id, adapter.clone())
        {
            if self.registry().has_actor(&actor_id) {
                warn!("Duplicate websocket id {}, dropping", request_id);
            } else {
                self.reject_websocket(request_id, "Actor not found");
            }
            return;
        }

        self.send_message(request_id, MessageKind::ToClientWebSocketOpen);
        adapter.handle_open();

        let inner = self.clone();
        tokio::spawn(async move {
            let session = handler.websocket(actor_id.clone(), adapter.clone(), request);
            let result = AssertUnwindSafe(session).catch_unwind().await;

            let cause = match result {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "handler panicked".to_string(),
            };
            error!(
                "Error handling websocket {} for actor {}: {}",
                request_id, actor_id, cause
            );

            if inner.registry().remove_websocket(&request_id).is_some() {
                inner.reject_websocket(request_id, "Server Error");
                adapter.handle_error(&cause);
                adapter.handle_close(Some(CLOSE_INTERNAL_ERROR), Some("Server Error".to_string()));
            }
        });
    }

    fn reject_websocket(&self, request_id: RequestId, reason: &str) {
        let close = WebSocketClose::new(CLOSE_INTERNAL_ERROR, reason);
        self.send_message(request_id, MessageKind::ToClientWebSocketClose(close));
    }

    fn handle_websocket_message(
        &self,
        request_id: RequestId,
        message: WebSocketMessage,
        direction: Direction,
    ) {
        let Some(adapter) = self.registry().websocket(&request_id, direction) else {
            debug!("Message for unknown websocket {}", request_id);
            return;
        };
        adapter.handle_message(message.data, message.binary);
    }

    fn handle_websocket_close(
        &self,
        request_id: RequestId,
        close: WebSocketClose,
        direction: Direction,
    ) {
        let adapter = self.registry().remove_websocket_in(&request_id, direction);
        let Some(adapter) = adapter else {
            debug!("Close for unknown websocket {}", request_id);
            return;
        };
        adapter.handle_close(close.code, close.reason);
    }

    /// Adapter whose sends and closes become frames for `request_id`.
    ///
    /// Callbacks hold a weak reference so adapters kept by handler code do
    /// not keep the client alive.
    pub(crate) fn create_adapter(
        self: &Arc<Self>,
        request_id: RequestId,
        direction: Direction,
    ) -> WebSocketAdapter {
        let on_send = Arc::downgrade(self);
        let on_close = Arc::downgrade(self);

        WebSocketAdapter::new(
            request_id,
            Box::new(move |data: Bytes, binary: bool| {
                let Some(inner) = on_send.upgrade() else {
                    return;
                };
                let message = WebSocketMessage { data, binary };
                let kind = match direction {
                    Direction::Inbound => MessageKind::ToClientWebSocketMessage(message),
                    Direction::Outbound => MessageKind::ToServerWebSocketMessage(message),
                };
                inner.send_message(request_id, kind);
            }),
            Box::new(move |code: Option<u16>, reason: Option<String>| {
                let Some(inner) = on_close.upgrade() else {
                    return;
                };
                let close = WebSocketClose { code, reason };
                let kind = match direction {
                    Direction::Inbound => MessageKind::ToClientWebSocketClose(close),
                    Direction::Outbound => MessageKind::ToServerWebSocketClose(close),
                };
                inner.send_message(request_id, kind);
                inner.registry().remove_websocket(&request_id);
            }),
        )
    }
}

/// Flatten a header map, joining repeated names with `", "`
pub(crate) fn headers_from_map(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        let Ok(value) = value.to_str() else {
            warn!("Dropping non-UTF-8 header {}", name);
            continue;
        };
        headers
            .entry(name.as_str().to_string())
            .and_modify(|joined| {
                joined.push_str(", ");
                joined.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    headers
}

fn build_request<B>(
    method: &str,
    path: &str,
    headers: &Headers,
    body: B,
) -> Result<Request<B>, http::Error> {
    let mut builder = Request::builder().method(method).uri(path);
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(body)
}

/// The GET request a WebSocket handler sees for an upgraded session
fn build_upgrade_request(path: &str, headers: &Headers) -> Result<Request<()>, http::Error> {
    let mut request = build_request("GET", path, headers, ())?;
    request
        .headers_mut()
        .insert(UPGRADE, HeaderValue::from_static("websocket"));
    request
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    Ok(request)
}

fn build_response(
    status: u16,
    headers: &Headers,
    body: Body,
) -> Result<Response<Body>, http::Error> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::SET_COOKIE;

    #[test]
    fn test_headers_from_map_joins_repeats() {
        let mut map = HeaderMap::new();
        map.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        map.append(SET_COOKIE, HeaderValue::from_static("b=2"));
        map.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let headers = headers_from_map(&map);
        assert_eq!(headers["set-cookie"], "a=1, b=2");
        assert_eq!(headers["content-type"], "text/plain");
    }

    #[test]
    fn test_build_request() {
        let mut headers = Headers::new();
        headers.insert("x-test".to_string(), "1".to_string());

        let request = build_request("POST", "/echo?x=1", &headers, ()).unwrap();
        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(request.uri().path(), "/echo");
        assert_eq!(request.uri().query(), Some("x=1"));
        assert_eq!(request.headers()["x-test"], "1");
    }

    #[test]
    fn test_build_request_rejects_bad_method() {
        assert!(build_request("BAD METHOD", "/", &Headers::new(), ()).is_err());
    }

    #[test]
    fn test_upgrade_request_overrides_headers() {
        let mut headers = Headers::new();
        headers.insert("connection".to_string(), "keep-alive".to_string());
        headers.insert("sec-websocket-protocol".to_string(), "rivet".to_string());

        let request = build_upgrade_request("/ws", &headers).unwrap();
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.headers()[UPGRADE], "websocket");
        assert_eq!(request.headers()[CONNECTION], "Upgrade");
        assert_eq!(request.headers()["sec-websocket-protocol"], "rivet");
    }

    #[test]
    fn test_build_response_rejects_bad_status() {
        assert!(build_response(42, &Headers::new(), Body::empty()).is_err());
        let response = build_response(204, &Headers::new(), Body::empty()).unwrap();
        assert_eq!(response.status(), http::StatusCode::NO_CONTENT);
    }
}
