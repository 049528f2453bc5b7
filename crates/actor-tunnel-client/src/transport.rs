//! Physical connection to the gateway

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use crate::config::TunnelConfig;
use crate::error::TransportError;

/// Header telling the gateway which service the socket is for
pub const TARGET_HEADER: &str = "x-rivet-target";
pub const TARGET_TUNNEL: &str = "tunnel";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One established connection, as a pair of frame channels.
///
/// Dropping `sender` closes the connection after queued frames are written.
/// `receiver` yields `None` once the connection is gone.
pub struct TunnelSocket {
    pub sender: mpsc::UnboundedSender<Bytes>,
    pub receiver: mpsc::UnboundedReceiver<Bytes>,
}

impl TunnelSocket {
    /// Two sockets wired back to back
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                sender: a_tx,
                receiver: b_rx,
            },
            Self {
                sender: b_tx,
                receiver: a_rx,
            },
        )
    }
}

/// Opens connections to the gateway
#[async_trait]
pub trait TunnelConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<TunnelSocket, TransportError>;
}

/// Connects over a real WebSocket
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            url: config.url.clone(),
            connect_timeout: config.connect_timeout,
        }
    }

    async fn writer_task(
        mut sink: futures_util::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
        conn_id: String,
    ) {
        while let Some(frame) = rx.recv().await {
            trace!("[{}] Sending frame ({} bytes)", conn_id, frame.len());
            if let Err(e) = sink.send(Message::Binary(frame.to_vec())).await {
                error!("[{}] WebSocket send error: {}", conn_id, e);
                break;
            }
        }

        debug!("[{}] WebSocket writer task ended", conn_id);
        let _ = sink.close().await;
    }

    async fn reader_task(
        mut source: futures_util::stream::SplitStream<WsStream>,
        tx: mpsc::UnboundedSender<Bytes>,
        conn_id: String,
    ) {
        while let Some(result) = source.next().await {
            match result {
                Ok(Message::Binary(data)) => {
                    if tx.send(Bytes::from(data)).is_err() {
                        debug!("[{}] Frame receiver dropped", conn_id);
                        break;
                    }
                }
                Ok(Message::Text(_)) => {
                    warn!("[{}] Ignoring text frame on tunnel socket", conn_id);
                }
                Ok(Message::Close(frame)) => {
                    match frame {
                        Some(frame) => info!(
                            "[{}] Tunnel closed by gateway: {} {}",
                            conn_id, frame.code, frame.reason
                        ),
                        None => info!("[{}] Tunnel closed by gateway", conn_id),
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("[{}] WebSocket receive error: {}", conn_id, e);
                    break;
                }
            }
        }

        debug!("[{}] WebSocket reader task ended", conn_id);
    }
}

#[async_trait]
impl TunnelConnector for WebSocketConnector {
    async fn connect(&self) -> Result<TunnelSocket, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        request
            .headers_mut()
            .insert(TARGET_HEADER, HeaderValue::from_static(TARGET_TUNNEL));

        debug!("Connecting to tunnel at {}", self.url);

        let (ws_stream, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| TransportError::Timeout(self.connect_timeout))?
                .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        let conn_id = format!("tunnel-{}", NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
        let (sink, source) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::writer_task(sink, out_rx, conn_id.clone()));
        tokio::spawn(Self::reader_task(source, in_tx, conn_id));

        Ok(TunnelSocket {
            sender: out_tx,
            receiver: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_socket_pair_is_crossed() {
        let (mut client, mut gateway) = TunnelSocket::pair();

        client.sender.send(Bytes::from_static(b"up")).unwrap();
        gateway.sender.send(Bytes::from_static(b"down")).unwrap();

        assert_eq!(gateway.receiver.recv().await.unwrap(), Bytes::from_static(b"up"));
        assert_eq!(client.receiver.recv().await.unwrap(), Bytes::from_static(b"down"));

        drop(gateway);
        assert!(client.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let config = TunnelConfig {
            url: "not a url".to_string(),
            ..TunnelConfig::default()
        };

        let result = WebSocketConnector::new(&config).connect().await;
        assert!(matches!(result, Err(TransportError::InvalidUrl(_))));
    }
}
