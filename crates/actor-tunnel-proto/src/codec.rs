//! Binary codec for tunnel envelopes
//!
//! Layout of one encoded envelope:
//!
//! ```text
//! [request_id: 16 bytes][message_id: 16 bytes][tag: u8][payload ...]
//! ```
//!
//! Payload primitives:
//! - `u16` is little-endian
//! - `uint` (lengths and counts) is an unsigned LEB128 varint
//! - `bool` is a single byte, `0` or `1`
//! - `data` is `uint` length followed by raw bytes
//! - `string` is `data` holding UTF-8
//! - `optional<T>` is a `bool` presence flag followed by `T` when set
//! - `headers` is a `uint` count followed by `string` key / `string` value
//!   pairs; keys must be unique
//!
//! The frame boundary is the WebSocket message itself, so the envelope
//! carries no outer length prefix. Decoding must consume every byte.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::ids::{MessageId, RequestId, ID_LEN};
use crate::messages::*;
use crate::MAX_FRAME_SIZE;

/// Longest valid varint for a u64
const MAX_VARINT_LEN: usize = 10;

/// Codec errors. Every variant means the frame was malformed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed frame: unexpected end of input at offset {offset}")]
    UnexpectedEof { offset: usize },

    #[error("malformed frame: unknown message tag {tag} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("malformed frame: {remaining} trailing bytes")]
    TrailingBytes { remaining: usize },

    #[error("malformed frame: duplicate header key {key:?}")]
    DuplicateKey { key: String },

    #[error("malformed frame: invalid bool byte {value} at offset {offset}")]
    InvalidBool { value: u8, offset: usize },

    #[error("malformed frame: invalid UTF-8 at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("malformed frame: varint overflow at offset {offset}")]
    VarintOverflow { offset: usize },

    #[error("malformed frame: {0} bytes exceeds maximum frame size")]
    FrameTooLarge(usize),
}

impl Envelope {
    /// Encode this envelope into a single frame payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 * ID_LEN + 1 + self.kind.size_hint());
        buf.put_slice(self.request_id.as_bytes());
        buf.put_slice(self.message_id.as_bytes());
        buf.put_u8(self.kind.tag() as u8);
        encode_kind(&mut buf, &self.kind);
        buf.freeze()
    }

    /// Decode an envelope from a complete frame payload
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(frame.len()));
        }

        let mut reader = FrameReader::new(frame);
        let request_id = RequestId::from_bytes(reader.read_id()?);
        let message_id = MessageId::from_bytes(reader.read_id()?);
        let kind = decode_kind(&mut reader)?;
        reader.finish()?;

        Ok(Self {
            request_id,
            message_id,
            kind,
        })
    }
}

impl MessageKind {
    fn size_hint(&self) -> usize {
        fn headers_len(headers: &Headers) -> usize {
            headers.iter().map(|(k, v)| k.len() + v.len() + 4).sum()
        }

        match self {
            Self::ToServerRequestStart(req) => {
                req.actor_id.len()
                    + req.method.len()
                    + req.path.len()
                    + headers_len(&req.headers)
                    + req.body.as_ref().map_or(0, Bytes::len)
                    + 16
            }
            Self::ToClientResponseStart(res) => {
                headers_len(&res.headers) + res.body.as_ref().map_or(0, Bytes::len) + 8
            }
            Self::ToServerRequestChunk(chunk) | Self::ToClientResponseChunk(chunk) => {
                chunk.body.len() + 6
            }
            Self::ToServerWebSocketOpen(open) => {
                open.actor_id.len() + open.path.len() + headers_len(&open.headers) + 8
            }
            Self::ToServerWebSocketMessage(msg) | Self::ToClientWebSocketMessage(msg) => {
                msg.data.len() + 6
            }
            Self::ToServerWebSocketClose(close) | Self::ToClientWebSocketClose(close) => {
                close.reason.as_ref().map_or(0, String::len) + 8
            }
            Self::Ack
            | Self::ToServerRequestAbort
            | Self::ToClientResponseAbort
            | Self::ToClientWebSocketOpen => 0,
        }
    }
}

fn encode_kind(buf: &mut BytesMut, kind: &MessageKind) {
    match kind {
        MessageKind::Ack
        | MessageKind::ToServerRequestAbort
        | MessageKind::ToClientResponseAbort
        | MessageKind::ToClientWebSocketOpen => {}
        MessageKind::ToServerRequestStart(req) => {
            put_string(buf, &req.actor_id);
            put_string(buf, &req.method);
            put_string(buf, &req.path);
            put_headers(buf, &req.headers);
            put_optional_data(buf, req.body.as_ref());
            put_bool(buf, req.stream);
        }
        MessageKind::ToClientResponseStart(res) => {
            buf.put_u16_le(res.status);
            put_headers(buf, &res.headers);
            put_optional_data(buf, res.body.as_ref());
            put_bool(buf, res.stream);
        }
        MessageKind::ToServerRequestChunk(chunk) | MessageKind::ToClientResponseChunk(chunk) => {
            put_data(buf, &chunk.body);
            put_bool(buf, chunk.finish);
        }
        MessageKind::ToServerWebSocketOpen(open) => {
            put_string(buf, &open.actor_id);
            put_string(buf, &open.path);
            put_headers(buf, &open.headers);
        }
        MessageKind::ToServerWebSocketMessage(msg) | MessageKind::ToClientWebSocketMessage(msg) => {
            put_data(buf, &msg.data);
            put_bool(buf, msg.binary);
        }
        MessageKind::ToServerWebSocketClose(close) | MessageKind::ToClientWebSocketClose(close) => {
            put_bool(buf, close.code.is_some());
            if let Some(code) = close.code {
                buf.put_u16_le(code);
            }
            put_bool(buf, close.reason.is_some());
            if let Some(reason) = &close.reason {
                put_string(buf, reason);
            }
        }
    }
}

fn decode_kind(reader: &mut FrameReader<'_>) -> Result<MessageKind, CodecError> {
    let offset = reader.pos;
    let raw = reader.read_u8()?;
    let tag = MessageTag::try_from(raw).map_err(|tag| {
        // Leave the cursor on the offending byte
        reader.pos = offset;
        CodecError::UnknownTag { tag, offset }
    })?;

    Ok(match tag {
        MessageTag::Ack => MessageKind::Ack,
        MessageTag::ToServerRequestStart => {
            MessageKind::ToServerRequestStart(ToServerRequestStart {
                actor_id: reader.read_string()?,
                method: reader.read_string()?,
                path: reader.read_string()?,
                headers: reader.read_headers()?,
                body: reader.read_optional_data()?,
                stream: reader.read_bool()?,
            })
        }
        MessageTag::ToServerRequestChunk => MessageKind::ToServerRequestChunk(reader.read_chunk()?),
        MessageTag::ToServerRequestAbort => MessageKind::ToServerRequestAbort,
        MessageTag::ToClientResponseStart => {
            MessageKind::ToClientResponseStart(ToClientResponseStart {
                status: reader.read_u16()?,
                headers: reader.read_headers()?,
                body: reader.read_optional_data()?,
                stream: reader.read_bool()?,
            })
        }
        MessageTag::ToClientResponseChunk => {
            MessageKind::ToClientResponseChunk(reader.read_chunk()?)
        }
        MessageTag::ToClientResponseAbort => MessageKind::ToClientResponseAbort,
        MessageTag::ToServerWebSocketOpen => MessageKind::ToServerWebSocketOpen(WebSocketOpen {
            actor_id: reader.read_string()?,
            path: reader.read_string()?,
            headers: reader.read_headers()?,
        }),
        MessageTag::ToServerWebSocketMessage => {
            MessageKind::ToServerWebSocketMessage(reader.read_ws_message()?)
        }
        MessageTag::ToServerWebSocketClose => {
            MessageKind::ToServerWebSocketClose(reader.read_ws_close()?)
        }
        MessageTag::ToClientWebSocketOpen => MessageKind::ToClientWebSocketOpen,
        MessageTag::ToClientWebSocketMessage => {
            MessageKind::ToClientWebSocketMessage(reader.read_ws_message()?)
        }
        MessageTag::ToClientWebSocketClose => {
            MessageKind::ToClientWebSocketClose(reader.read_ws_close()?)
        }
    })
}

fn put_uint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(value as u8);
}

fn put_data(buf: &mut BytesMut, data: &[u8]) {
    put_uint(buf, data.len() as u64);
    buf.put_slice(data);
}

fn put_string(buf: &mut BytesMut, value: &str) {
    put_data(buf, value.as_bytes());
}

fn put_optional_data(buf: &mut BytesMut, data: Option<&Bytes>) {
    put_bool(buf, data.is_some());
    if let Some(data) = data {
        put_data(buf, data);
    }
}

fn put_headers(buf: &mut BytesMut, headers: &Headers) {
    put_uint(buf, headers.len() as u64);
    for (key, value) in headers {
        put_string(buf, key);
        put_string(buf, value);
    }
}

/// Cursor over a frame being decoded
struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::UnexpectedEof { offset: self.pos });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_id(&mut self) -> Result<[u8; ID_LEN], CodecError> {
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(self.take(ID_LEN)?);
        Ok(id)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_uint(&mut self) -> Result<u64, CodecError> {
        let start = self.pos;
        let mut value: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.read_u8()?;
            let bits = u64::from(byte & 0x7f);
            // The tenth byte may only contribute the top bit of a u64
            if i == MAX_VARINT_LEN - 1 && bits > 1 {
                return Err(CodecError::VarintOverflow { offset: start });
            }
            value |= bits << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::VarintOverflow { offset: start })
    }

    fn read_len(&mut self) -> Result<usize, CodecError> {
        let offset = self.pos;
        let len = self.read_uint()?;
        // A length can never exceed what is left in the frame
        usize::try_from(len)
            .ok()
            .filter(|len| *len <= self.remaining())
            .ok_or(CodecError::UnexpectedEof { offset })
    }

    fn read_bool(&mut self) -> Result<bool, CodecError> {
        let offset = self.pos;
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(CodecError::InvalidBool { value, offset }),
        }
    }

    fn read_data(&mut self) -> Result<Bytes, CodecError> {
        let len = self.read_len()?;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_len()?;
        let offset = self.pos;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8 { offset })
    }

    fn read_optional_data(&mut self) -> Result<Option<Bytes>, CodecError> {
        if self.read_bool()? {
            self.read_data().map(Some)
        } else {
            Ok(None)
        }
    }

    fn read_headers(&mut self) -> Result<Headers, CodecError> {
        let count = self.read_uint()?;
        let mut headers = Headers::new();
        for _ in 0..count {
            let key = self.read_string()?;
            if headers.contains_key(&key) {
                return Err(CodecError::DuplicateKey { key });
            }
            let value = self.read_string()?;
            headers.insert(key, value);
        }
        Ok(headers)
    }

    fn read_chunk(&mut self) -> Result<BodyChunk, CodecError> {
        Ok(BodyChunk {
            body: self.read_data()?,
            finish: self.read_bool()?,
        })
    }

    fn read_ws_message(&mut self) -> Result<WebSocketMessage, CodecError> {
        Ok(WebSocketMessage {
            data: self.read_data()?,
            binary: self.read_bool()?,
        })
    }

    fn read_ws_close(&mut self) -> Result<WebSocketClose, CodecError> {
        let code = if self.read_bool()? {
            Some(self.read_u16()?)
        } else {
            None
        };
        let reason = if self.read_bool()? {
            Some(self.read_string()?)
        } else {
            None
        };
        Ok(WebSocketClose { code, reason })
    }

    fn finish(self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            remaining => Err(CodecError::TrailingBytes { remaining }),
        }
    }
}
