//! Request and response bodies carried through the tunnel
//!
//! A body is either fully buffered or fed chunk by chunk from tunnel frames.
//! A streamed body ends cleanly when its [`BodySender`] finishes and ends
//! with an error when the sender aborts it.

use bytes::{Bytes, BytesMut};
use std::fmt;
use tokio::sync::mpsc;

use crate::error::TunnelError;

type Chunk = Result<Bytes, TunnelError>;

pub struct Body {
    inner: BodyInner,
}

enum BodyInner {
    Full(Option<Bytes>),
    Streaming(mpsc::UnboundedReceiver<Chunk>),
}

impl Body {
    pub fn empty() -> Self {
        Self {
            inner: BodyInner::Full(None),
        }
    }

    pub fn full(bytes: impl Into<Bytes>) -> Self {
        Self {
            inner: BodyInner::Full(Some(bytes.into())),
        }
    }

    /// Create a streamed body and the sender feeding it
    pub fn channel() -> (BodySender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            BodySender { tx },
            Self {
                inner: BodyInner::Streaming(rx),
            },
        )
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.inner, BodyInner::Streaming(_))
    }

    /// Buffered bytes of a non-streamed body, or the body back if it streams
    pub fn try_into_bytes(self) -> Result<Option<Bytes>, Self> {
        match self.inner {
            BodyInner::Full(bytes) => Ok(bytes),
            inner => Err(Self { inner }),
        }
    }

    /// Next chunk, `None` once the body has ended cleanly
    pub async fn chunk(&mut self) -> Option<Result<Bytes, TunnelError>> {
        match &mut self.inner {
            BodyInner::Full(bytes) => bytes.take().filter(|b| !b.is_empty()).map(Ok),
            BodyInner::Streaming(rx) => rx.recv().await,
        }
    }

    /// Read the whole body
    pub async fn collect(mut self) -> Result<Bytes, TunnelError> {
        if let BodyInner::Full(bytes) = &mut self.inner {
            return Ok(bytes.take().unwrap_or_default());
        }

        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            BodyInner::Full(bytes) => f
                .debug_struct("Body")
                .field("len", &bytes.as_ref().map_or(0, Bytes::len))
                .finish(),
            BodyInner::Streaming(_) => f.debug_struct("Body").field("streaming", &true).finish(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::full(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::full(bytes)
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::full(text)
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Self::full(text)
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Self {
        Self::full(bytes)
    }
}

/// Feeds a streamed [`Body`]
#[derive(Debug)]
pub struct BodySender {
    tx: mpsc::UnboundedSender<Chunk>,
}

impl BodySender {
    /// Append a chunk. Returns false if the body was dropped by its reader.
    pub fn push(&self, chunk: Bytes) -> bool {
        if chunk.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx.send(Ok(chunk)).is_ok()
    }

    /// End the body cleanly
    pub fn finish(self) {}

    /// End the body with an error seen by the reader
    pub fn abort(self, error: TunnelError) {
        let _ = self.tx.send(Err(error));
    }
}
