//! WebSocket-like adapter for tunneled connections
//!
//! Handler code sees an object that behaves like a native WebSocket:
//! a ready state, `send`/`close`, event listeners and `on*` handlers.
//! Underneath, every send and close becomes a tunnel frame and every
//! tunnel frame for the session becomes a local event.
//!
//! Events fired while nobody listens for their type are buffered and
//! replayed, in order, as soon as a listener or handler for that type is
//! attached. This covers the window between the tunnel opening the session
//! and handler code attaching `on_open`.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, trace};

use actor_tunnel_proto::RequestId;

use crate::error::TunnelError;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// Closed without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Server hit an unexpected condition
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

/// How received binary messages are surfaced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BinaryType {
    /// Shared, reference-counted buffer
    #[default]
    Buffer,
    /// Owned contiguous copy
    ArrayBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Open,
    Message,
    Close,
    Error,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Message => "message",
            Self::Close => "close",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Payload of a received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageData {
    Text(String),
    Buffer(Bytes),
    ArrayBuffer(Vec<u8>),
}

impl MessageData {
    pub fn is_binary(&self) -> bool {
        !matches!(self, Self::Text(_))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Buffer(bytes) => &bytes[..],
            Self::ArrayBuffer(bytes) => &bytes[..],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
    pub was_clean: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub cause: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebSocketEvent {
    Open,
    Message(MessageData),
    Close(CloseEvent),
    Error(ErrorEvent),
}

impl WebSocketEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Open => EventType::Open,
            Self::Message(_) => EventType::Message,
            Self::Close(_) => EventType::Close,
            Self::Error(_) => EventType::Error,
        }
    }
}

/// Data handed to [`WebSocketAdapter::send`].
///
/// Borrowed and growable buffers are copied into a fresh buffer so the
/// tunnel never aliases memory the caller can still mutate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Text(String),
    Binary(Bytes),
}

impl From<&str> for OutboundMessage {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for OutboundMessage {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Bytes> for OutboundMessage {
    fn from(bytes: Bytes) -> Self {
        Self::Binary(bytes)
    }
}

impl From<Vec<u8>> for OutboundMessage {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(bytes))
    }
}

impl From<&[u8]> for OutboundMessage {
    fn from(bytes: &[u8]) -> Self {
        Self::Binary(Bytes::copy_from_slice(bytes))
    }
}

impl From<&Vec<u8>> for OutboundMessage {
    fn from(bytes: &Vec<u8>) -> Self {
        Self::Binary(Bytes::copy_from_slice(bytes))
    }
}

impl From<&BytesMut> for OutboundMessage {
    fn from(bytes: &BytesMut) -> Self {
        Self::Binary(Bytes::copy_from_slice(bytes))
    }
}

impl From<MessageData> for OutboundMessage {
    fn from(data: MessageData) -> Self {
        match data {
            MessageData::Text(text) => Self::Text(text),
            MessageData::Buffer(bytes) => Self::Binary(bytes),
            MessageData::ArrayBuffer(bytes) => Self::Binary(Bytes::from(bytes)),
        }
    }
}

/// Identifies a listener added with [`WebSocketAdapter::add_event_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&WebSocketAdapter, &WebSocketEvent) + Send + Sync>;

pub(crate) type SendCallback = Box<dyn Fn(Bytes, bool) + Send + Sync>;
pub(crate) type CloseCallback = Box<dyn Fn(Option<u16>, Option<String>) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    open: Option<Listener>,
    message: Option<Listener>,
    close: Option<Listener>,
    error: Option<Listener>,
}

impl Handlers {
    fn slot(&mut self, event_type: EventType) -> &mut Option<Listener> {
        match event_type {
            EventType::Open => &mut self.open,
            EventType::Message => &mut self.message,
            EventType::Close => &mut self.close,
            EventType::Error => &mut self.error,
        }
    }
}

struct AdapterState {
    ready_state: ReadyState,
    binary_type: BinaryType,
    listeners: Vec<(ListenerId, EventType, Listener)>,
    handlers: Handlers,
    buffered: Vec<WebSocketEvent>,
    next_listener_id: u64,
}

impl AdapterState {
    fn targets(&mut self, event_type: EventType) -> Vec<Listener> {
        let mut targets: Vec<Listener> = self
            .listeners
            .iter()
            .filter(|(_, ty, _)| *ty == event_type)
            .map(|(_, _, listener)| listener.clone())
            .collect();
        if let Some(handler) = self.handlers.slot(event_type) {
            targets.push(handler.clone());
        }
        targets
    }

    fn take_buffered(&mut self, event_type: EventType) -> Vec<WebSocketEvent> {
        let (flush, keep) = std::mem::take(&mut self.buffered)
            .into_iter()
            .partition(|event| event.event_type() == event_type);
        self.buffered = keep;
        flush
    }
}

struct AdapterInner {
    id: RequestId,
    state: Mutex<AdapterState>,
    send_callback: SendCallback,
    close_callback: CloseCallback,
}

/// Local stand-in for a WebSocket session carried over the tunnel.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct WebSocketAdapter {
    inner: Arc<AdapterInner>,
}

impl fmt::Debug for WebSocketAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketAdapter")
            .field("id", &self.inner.id)
            .field("ready_state", &self.ready_state())
            .finish()
    }
}

impl WebSocketAdapter {
    pub(crate) fn new(
        id: RequestId,
        send_callback: SendCallback,
        close_callback: CloseCallback,
    ) -> Self {
        Self {
            inner: Arc::new(AdapterInner {
                id,
                state: Mutex::new(AdapterState {
                    ready_state: ReadyState::Connecting,
                    binary_type: BinaryType::default(),
                    listeners: Vec::new(),
                    handlers: Handlers::default(),
                    buffered: Vec::new(),
                    next_listener_id: 0,
                }),
                send_callback,
                close_callback,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, AdapterState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Tunnel id of this session
    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    pub fn ready_state(&self) -> ReadyState {
        self.state().ready_state
    }

    pub fn binary_type(&self) -> BinaryType {
        self.state().binary_type
    }

    pub fn set_binary_type(&self, binary_type: BinaryType) {
        self.state().binary_type = binary_type;
    }

    /// Send a text or binary message to the peer
    pub fn send(&self, data: impl Into<OutboundMessage>) -> Result<(), TunnelError> {
        if self.ready_state() != ReadyState::Open {
            return Err(TunnelError::WebSocketNotOpen);
        }

        match data.into() {
            OutboundMessage::Text(text) => (self.inner.send_callback)(Bytes::from(text), false),
            OutboundMessage::Binary(bytes) => (self.inner.send_callback)(bytes, true),
        }
        Ok(())
    }

    /// Close the session. Does nothing once closing has started.
    ///
    /// The close frame is emitted and the state is `Closed` by the time the
    /// local close event fires.
    pub fn close(&self, code: Option<u16>, reason: Option<String>) {
        {
            let mut state = self.state();
            if matches!(state.ready_state, ReadyState::Closing | ReadyState::Closed) {
                return;
            }
            state.ready_state = ReadyState::Closing;
        }

        (self.inner.close_callback)(code, reason.clone());

        self.state().ready_state = ReadyState::Closed;

        self.fire_event(WebSocketEvent::Close(CloseEvent {
            code: code.unwrap_or(CLOSE_NORMAL),
            reason: reason.unwrap_or_default(),
            was_clean: true,
        }));
    }

    /// Drop the session immediately without a clean close
    pub fn terminate(&self) {
        {
            let mut state = self.state();
            if state.ready_state == ReadyState::Closed {
                return;
            }
            state.ready_state = ReadyState::Closed;
        }

        (self.inner.close_callback)(Some(CLOSE_ABNORMAL), Some("Abnormal Closure".to_string()));

        self.fire_event(WebSocketEvent::Close(CloseEvent {
            code: CLOSE_ABNORMAL,
            reason: "Abnormal Closure".to_string(),
            was_clean: false,
        }));
    }

    pub fn ping(&self, _data: &[u8]) -> Result<(), TunnelError> {
        Err(TunnelError::Unsupported("ping"))
    }

    pub fn pong(&self, _data: &[u8]) -> Result<(), TunnelError> {
        Err(TunnelError::Unsupported("pong"))
    }

    /// Register a listener. Buffered events of this type are replayed to it.
    pub fn add_event_listener<F>(&self, event_type: EventType, listener: F) -> ListenerId
    where
        F: Fn(&WebSocketAdapter, &WebSocketEvent) + Send + Sync + 'static,
    {
        let id = {
            let mut state = self.state();
            let id = ListenerId(state.next_listener_id);
            state.next_listener_id += 1;
            state.listeners.push((id, event_type, Arc::new(listener)));
            id
        };
        self.flush_buffered(event_type);
        id
    }

    pub fn remove_event_listener(&self, id: ListenerId) {
        self.state().listeners.retain(|(listener_id, _, _)| *listener_id != id);
    }

    pub fn on_open<F>(&self, handler: F)
    where
        F: Fn(&WebSocketAdapter, &WebSocketEvent) + Send + Sync + 'static,
    {
        self.set_handler(EventType::Open, Arc::new(handler));
    }

    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&WebSocketAdapter, &WebSocketEvent) + Send + Sync + 'static,
    {
        self.set_handler(EventType::Message, Arc::new(handler));
    }

    pub fn on_close<F>(&self, handler: F)
    where
        F: Fn(&WebSocketAdapter, &WebSocketEvent) + Send + Sync + 'static,
    {
        self.set_handler(EventType::Close, Arc::new(handler));
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&WebSocketAdapter, &WebSocketEvent) + Send + Sync + 'static,
    {
        self.set_handler(EventType::Error, Arc::new(handler));
    }

    /// Remove the `on_*` handler for an event type
    pub fn clear_handler(&self, event_type: EventType) {
        *self.state().handlers.slot(event_type) = None;
    }

    fn set_handler(&self, event_type: EventType, handler: Listener) {
        *self.state().handlers.slot(event_type) = Some(handler);
        self.flush_buffered(event_type);
    }

    pub(crate) fn handle_open(&self) {
        {
            let mut state = self.state();
            if state.ready_state != ReadyState::Connecting {
                return;
            }
            state.ready_state = ReadyState::Open;
        }

        self.fire_event(WebSocketEvent::Open);
    }

    pub(crate) fn handle_message(&self, data: Bytes, binary: bool) {
        let binary_type = {
            let state = self.state();
            if state.ready_state != ReadyState::Open {
                trace!("Dropping message for websocket {} in {:?}", self.id(), state.ready_state);
                return;
            }
            state.binary_type
        };

        let data = if !binary {
            MessageData::Text(String::from_utf8_lossy(&data).into_owned())
        } else {
            match binary_type {
                BinaryType::Buffer => MessageData::Buffer(data),
                BinaryType::ArrayBuffer => MessageData::ArrayBuffer(data.to_vec()),
            }
        };

        self.fire_event(WebSocketEvent::Message(data));
    }

    pub(crate) fn handle_close(&self, code: Option<u16>, reason: Option<String>) {
        {
            let mut state = self.state();
            if state.ready_state == ReadyState::Closed {
                return;
            }
            state.ready_state = ReadyState::Closed;
        }

        self.fire_event(WebSocketEvent::Close(CloseEvent {
            code: code.unwrap_or(CLOSE_NORMAL),
            reason: reason.unwrap_or_default(),
            was_clean: true,
        }));
    }

    pub(crate) fn handle_error(&self, cause: impl fmt::Display) {
        self.fire_event(WebSocketEvent::Error(ErrorEvent {
            cause: cause.to_string(),
        }));
    }

    fn fire_event(&self, event: WebSocketEvent) {
        let event_type = event.event_type();
        let targets = {
            let mut state = self.state();
            let targets = state.targets(event_type);
            if targets.is_empty() {
                trace!("Buffering {} event for websocket {}", event_type, self.id());
                state.buffered.push(event);
                return;
            }
            targets
        };

        self.dispatch(&targets, &event);
    }

    fn flush_buffered(&self, event_type: EventType) {
        let events = self.state().take_buffered(event_type);
        for event in events {
            let targets = self.state().targets(event_type);
            self.dispatch(&targets, &event);
        }
    }

    fn dispatch(&self, targets: &[Listener], event: &WebSocketEvent) {
        for listener in targets {
            if catch_unwind(AssertUnwindSafe(|| listener(self, event))).is_err() {
                error!(
                    "Error in websocket {} listener for {}",
                    event.event_type(),
                    self.id()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Sent = Arc<Mutex<Vec<(Bytes, bool)>>>;
    type Closed = Arc<Mutex<Vec<(Option<u16>, Option<String>)>>>;

    fn adapter() -> (WebSocketAdapter, Sent, Closed) {
        let sent: Sent = Arc::default();
        let closed: Closed = Arc::default();
        let sent_cb = sent.clone();
        let closed_cb = closed.clone();
        let adapter = WebSocketAdapter::new(
            RequestId::new(),
            Box::new(move |data, binary| sent_cb.lock().unwrap().push((data, binary))),
            Box::new(move |code, reason| closed_cb.lock().unwrap().push((code, reason))),
        );
        (adapter, sent, closed)
    }

    fn recorder() -> (
        Arc<Mutex<Vec<WebSocketEvent>>>,
        impl Fn(&WebSocketAdapter, &WebSocketEvent) + Send + Sync + 'static,
    ) {
        let events: Arc<Mutex<Vec<WebSocketEvent>>> = Arc::default();
        let sink = events.clone();
        (events, move |_: &WebSocketAdapter, event: &WebSocketEvent| {
            sink.lock().unwrap().push(event.clone())
        })
    }

    #[test]
    fn test_send_requires_open() {
        let (ws, sent, _) = adapter();
        assert!(matches!(ws.send("hi"), Err(TunnelError::WebSocketNotOpen)));

        ws.handle_open();
        ws.send("hi").unwrap();
        ws.send(vec![1u8, 2, 3]).unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0], (Bytes::from_static(b"hi"), false));
        assert_eq!(sent[1], (Bytes::from_static(&[1, 2, 3]), true));
    }

    #[test]
    fn test_send_copies_borrowed_buffers() {
        let (ws, sent, _) = adapter();
        ws.handle_open();

        let mut buf = BytesMut::from(&b"abc"[..]);
        ws.send(&buf).unwrap();
        buf[0] = b'z';

        assert_eq!(sent.lock().unwrap()[0].0, Bytes::from_static(b"abc"));
    }

    #[test]
    fn test_buffered_events_flush_per_type_in_order() {
        let (ws, _, _) = adapter();

        ws.handle_open();
        ws.handle_message(Bytes::from_static(b"one"), false);
        ws.handle_message(Bytes::from_static(b"two"), false);

        let (messages, record_messages) = recorder();
        ws.on_message(record_messages);

        assert_eq!(
            *messages.lock().unwrap(),
            vec![
                WebSocketEvent::Message(MessageData::Text("one".to_string())),
                WebSocketEvent::Message(MessageData::Text("two".to_string())),
            ]
        );

        // The open event stays queued until someone listens for it
        let (opens, record_opens) = recorder();
        ws.add_event_listener(EventType::Open, record_opens);
        assert_eq!(*opens.lock().unwrap(), vec![WebSocketEvent::Open]);
    }

    #[test]
    fn test_events_go_to_listeners_and_handler() {
        let (ws, _, _) = adapter();
        let (a, record_a) = recorder();
        let (b, record_b) = recorder();
        ws.add_event_listener(EventType::Open, record_a);
        ws.on_open(record_b);

        ws.handle_open();
        ws.handle_open();

        assert_eq!(a.lock().unwrap().len(), 1);
        assert_eq!(b.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_removed_listener_not_called() {
        let (ws, _, _) = adapter();
        let (events, record) = recorder();
        let id = ws.add_event_listener(EventType::Open, record);
        ws.remove_event_listener(id);
        ws.on_open(|_, _| {});

        ws.handle_open();
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (ws, _, closed) = adapter();
        let (events, record) = recorder();
        ws.on_close(record);
        ws.handle_open();

        ws.close(Some(4000), Some("bye".to_string()));
        ws.close(None, None);
        ws.terminate();

        assert_eq!(ws.ready_state(), ReadyState::Closed);
        assert_eq!(
            *closed.lock().unwrap(),
            vec![(Some(4000), Some("bye".to_string()))]
        );
        assert_eq!(
            *events.lock().unwrap(),
            vec![WebSocketEvent::Close(CloseEvent {
                code: 4000,
                reason: "bye".to_string(),
                was_clean: true,
            })]
        );
    }

    #[test]
    fn test_state_is_closed_when_close_event_fires() {
        let (ws, _, _) = adapter();
        let observed = Arc::new(Mutex::new(None));
        let sink = observed.clone();
        ws.on_close(move |ws, _| *sink.lock().unwrap() = Some(ws.ready_state()));
        ws.handle_open();

        ws.close(None, None);
        assert_eq!(*observed.lock().unwrap(), Some(ReadyState::Closed));
    }

    #[test]
    fn test_terminate_is_unclean() {
        let (ws, _, closed) = adapter();
        let (events, record) = recorder();
        ws.on_close(record);
        ws.handle_open();

        ws.terminate();

        assert_eq!(
            *closed.lock().unwrap(),
            vec![(Some(1006), Some("Abnormal Closure".to_string()))]
        );
        assert!(matches!(
            &events.lock().unwrap()[0],
            WebSocketEvent::Close(CloseEvent { code: 1006, was_clean: false, .. })
        ));
    }

    #[test]
    fn test_binary_type_controls_message_data() {
        let (ws, _, _) = adapter();
        let (events, record) = recorder();
        ws.on_message(record);
        ws.handle_open();

        ws.handle_message(Bytes::from_static(&[1, 2]), true);
        ws.set_binary_type(BinaryType::ArrayBuffer);
        ws.handle_message(Bytes::from_static(&[3, 4]), true);

        let events = events.lock().unwrap();
        assert_eq!(
            events[0],
            WebSocketEvent::Message(MessageData::Buffer(Bytes::from_static(&[1, 2])))
        );
        assert_eq!(
            events[1],
            WebSocketEvent::Message(MessageData::ArrayBuffer(vec![3, 4]))
        );
    }

    #[test]
    fn test_messages_ignored_unless_open() {
        let (ws, _, _) = adapter();
        let (events, record) = recorder();
        ws.on_message(record);

        ws.handle_message(Bytes::from_static(b"early"), false);
        ws.handle_open();
        ws.handle_close(None, None);
        ws.handle_message(Bytes::from_static(b"late"), false);

        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_echo_from_inside_handler() {
        let (ws, sent, _) = adapter();
        ws.on_message(|ws, event| {
            if let WebSocketEvent::Message(data) = event {
                ws.send(data.clone()).unwrap();
            }
        });
        ws.handle_open();
        ws.handle_message(Bytes::from_static(b"ping"), false);

        assert_eq!(
            *sent.lock().unwrap(),
            vec![(Bytes::from_static(b"ping"), false)]
        );
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let (ws, _, _) = adapter();
        let (events, record) = recorder();
        ws.add_event_listener(EventType::Error, |_, _| panic!("listener bug"));
        ws.on_error(record);

        ws.handle_error("socket reset");

        assert_eq!(
            *events.lock().unwrap(),
            vec![WebSocketEvent::Error(ErrorEvent {
                cause: "socket reset".to_string()
            })]
        );
    }

    #[test]
    fn test_ping_unsupported() {
        let (ws, _, _) = adapter();
        assert!(matches!(ws.ping(b""), Err(TunnelError::Unsupported("ping"))));
    }
}
