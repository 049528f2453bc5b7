//! Protocol message types

use bytes::Bytes;
use std::collections::BTreeMap;

use crate::ids::{MessageId, RequestId};

/// Header map carried by request, response and WebSocket open messages.
///
/// Keys are unique; the codec rejects duplicates on decode.
pub type Headers = BTreeMap<String, String>;

/// Envelope wrapping every message sent over the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub request_id: RequestId,
    pub message_id: MessageId,
    pub kind: MessageKind,
}

impl Envelope {
    /// Build an envelope with a freshly generated message id
    pub fn new(request_id: RequestId, kind: MessageKind) -> Self {
        Self {
            request_id,
            message_id: MessageId::new(),
            kind,
        }
    }

    /// Acknowledge a received envelope
    pub fn ack(request_id: RequestId, message_id: MessageId) -> Self {
        Self {
            request_id,
            message_id,
            kind: MessageKind::Ack,
        }
    }
}

/// How a streamed body ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFinishReason {
    Complete,
    Aborted,
}

/// Message kinds. Tag values are stable and listed in [`MessageTag`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Ack,

    // HTTP request forwarding (gateway -> runner)
    ToServerRequestStart(ToServerRequestStart),
    ToServerRequestChunk(BodyChunk),
    ToServerRequestAbort,

    // HTTP responses (runner -> gateway)
    ToClientResponseStart(ToClientResponseStart),
    ToClientResponseChunk(BodyChunk),
    ToClientResponseAbort,

    // WebSocket forwarding (gateway -> runner)
    ToServerWebSocketOpen(WebSocketOpen),
    ToServerWebSocketMessage(WebSocketMessage),
    ToServerWebSocketClose(WebSocketClose),

    // WebSocket replies (runner -> gateway)
    ToClientWebSocketOpen,
    ToClientWebSocketMessage(WebSocketMessage),
    ToClientWebSocketClose(WebSocketClose),
}

impl MessageKind {
    /// Terminate a streamed request body.
    ///
    /// `Complete` rides on a final empty chunk, anything else is an abort.
    pub fn request_finish(reason: StreamFinishReason) -> Self {
        match reason {
            StreamFinishReason::Complete => {
                Self::ToServerRequestChunk(BodyChunk::last(Bytes::new()))
            }
            StreamFinishReason::Aborted => Self::ToServerRequestAbort,
        }
    }

    /// Terminate a streamed response body
    pub fn response_finish(reason: StreamFinishReason) -> Self {
        match reason {
            StreamFinishReason::Complete => {
                Self::ToClientResponseChunk(BodyChunk::last(Bytes::new()))
            }
            StreamFinishReason::Aborted => Self::ToClientResponseAbort,
        }
    }

    pub fn tag(&self) -> MessageTag {
        match self {
            Self::Ack => MessageTag::Ack,
            Self::ToServerRequestStart(_) => MessageTag::ToServerRequestStart,
            Self::ToServerRequestChunk(_) => MessageTag::ToServerRequestChunk,
            Self::ToServerRequestAbort => MessageTag::ToServerRequestAbort,
            Self::ToClientResponseStart(_) => MessageTag::ToClientResponseStart,
            Self::ToClientResponseChunk(_) => MessageTag::ToClientResponseChunk,
            Self::ToClientResponseAbort => MessageTag::ToClientResponseAbort,
            Self::ToServerWebSocketOpen(_) => MessageTag::ToServerWebSocketOpen,
            Self::ToServerWebSocketMessage(_) => MessageTag::ToServerWebSocketMessage,
            Self::ToServerWebSocketClose(_) => MessageTag::ToServerWebSocketClose,
            Self::ToClientWebSocketOpen => MessageTag::ToClientWebSocketOpen,
            Self::ToClientWebSocketMessage(_) => MessageTag::ToClientWebSocketMessage,
            Self::ToClientWebSocketClose(_) => MessageTag::ToClientWebSocketClose,
        }
    }
}

/// Wire tags for [`MessageKind`]. Must not be renumbered without a
/// protocol version bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageTag {
    Ack = 0,
    ToServerRequestStart = 1,
    ToServerRequestChunk = 2,
    ToServerRequestAbort = 3,
    ToClientResponseStart = 4,
    ToClientResponseChunk = 5,
    ToClientResponseAbort = 6,
    ToServerWebSocketOpen = 7,
    ToServerWebSocketMessage = 8,
    ToServerWebSocketClose = 9,
    ToClientWebSocketOpen = 10,
    ToClientWebSocketMessage = 11,
    ToClientWebSocketClose = 12,
}

impl TryFrom<u8> for MessageTag {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Ack,
            1 => Self::ToServerRequestStart,
            2 => Self::ToServerRequestChunk,
            3 => Self::ToServerRequestAbort,
            4 => Self::ToClientResponseStart,
            5 => Self::ToClientResponseChunk,
            6 => Self::ToClientResponseAbort,
            7 => Self::ToServerWebSocketOpen,
            8 => Self::ToServerWebSocketMessage,
            9 => Self::ToServerWebSocketClose,
            10 => Self::ToClientWebSocketOpen,
            11 => Self::ToClientWebSocketMessage,
            12 => Self::ToClientWebSocketClose,
            other => return Err(other),
        })
    }
}

/// Opens an HTTP request aimed at an actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToServerRequestStart {
    pub actor_id: String,
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    /// When set, the body continues in `ToServerRequestChunk` frames
    pub stream: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToClientResponseStart {
    pub status: u16,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub stream: bool,
}

/// A body fragment of a streamed request or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyChunk {
    pub body: Bytes,
    /// Last fragment; the body completes normally after it
    pub finish: bool,
}

impl BodyChunk {
    pub fn more(body: Bytes) -> Self {
        Self {
            body,
            finish: false,
        }
    }

    pub fn last(body: Bytes) -> Self {
        Self { body, finish: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketOpen {
    pub actor_id: String,
    pub path: String,
    pub headers: Headers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketMessage {
    pub data: Bytes,
    /// `false` means `data` is UTF-8 text
    pub binary: bool,
}

impl WebSocketMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            data: Bytes::from(text.into()),
            binary: false,
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            binary: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebSocketClose {
    pub code: Option<u16>,
    pub reason: Option<String>,
}

impl WebSocketClose {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: Some(reason.into()),
        }
    }
}
