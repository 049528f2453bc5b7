//! In-memory gateway used by the integration tests

#![allow(dead_code)]

use actor_tunnel_client::{
    TransportError, TunnelClient, TunnelConfig, TunnelConnector, TunnelHandlers, TunnelSocket,
};
use actor_tunnel_proto::{Envelope, Headers, MessageId, MessageKind, RequestId};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const ACTOR: &str = "actor-1";

const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("actor_tunnel_client=debug")
        .with_test_writer()
        .try_init();
}

/// Hands every connection attempt to the paired [`Gateway`]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<GatewayConnection>,
    attempts: mpsc::UnboundedSender<Instant>,
    refuse: Arc<AtomicBool>,
}

#[async_trait]
impl TunnelConnector for MemoryConnector {
    async fn connect(&self) -> Result<TunnelSocket, TransportError> {
        let _ = self.attempts.send(Instant::now());
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionError(
                "connection refused".to_string(),
            ));
        }

        let (client, gateway) = TunnelSocket::pair();
        self.accepted
            .send(GatewayConnection { socket: gateway })
            .map_err(|_| TransportError::ConnectionError("gateway gone".to_string()))?;
        Ok(client)
    }
}

pub struct Gateway {
    accepted: mpsc::UnboundedReceiver<GatewayConnection>,
    attempts: mpsc::UnboundedReceiver<Instant>,
    refuse: Arc<AtomicBool>,
}

pub fn memory_gateway() -> (MemoryConnector, Gateway) {
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
    let (attempts_tx, attempts_rx) = mpsc::unbounded_channel();
    let refuse = Arc::new(AtomicBool::new(false));

    (
        MemoryConnector {
            accepted: accepted_tx,
            attempts: attempts_tx,
            refuse: refuse.clone(),
        },
        Gateway {
            accepted: accepted_rx,
            attempts: attempts_rx,
            refuse,
        },
    )
}

impl Gateway {
    pub async fn accept(&mut self) -> GatewayConnection {
        tokio::time::timeout(WAIT, self.accepted.recv())
            .await
            .expect("timed out waiting for tunnel connection")
            .expect("connector dropped")
    }

    /// Time of the next connection attempt, successful or not
    pub async fn next_attempt(&mut self) -> Instant {
        tokio::time::timeout(Duration::from_secs(120), self.attempts.recv())
            .await
            .expect("timed out waiting for connection attempt")
            .expect("connector dropped")
    }

    pub async fn assert_no_attempt(&mut self) {
        let attempt = tokio::time::timeout(Duration::from_millis(100), self.attempts.recv()).await;
        assert!(attempt.is_err(), "unexpected connection attempt");
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

/// Gateway end of one tunnel connection
pub struct GatewayConnection {
    socket: TunnelSocket,
}

impl GatewayConnection {
    pub fn send(&self, request_id: RequestId, kind: MessageKind) -> MessageId {
        let envelope = Envelope::new(request_id, kind);
        self.send_raw(envelope.encode());
        envelope.message_id
    }

    pub fn ack(&self, envelope: &Envelope) {
        self.send_raw(Envelope::ack(envelope.request_id, envelope.message_id).encode());
    }

    pub fn send_raw(&self, frame: Bytes) {
        self.socket
            .sender
            .send(frame)
            .expect("client side of tunnel closed");
    }

    /// Next envelope from the client, acks included
    pub async fn recv_envelope(&mut self) -> Envelope {
        let frame = tokio::time::timeout(WAIT, self.socket.receiver.recv())
            .await
            .expect("timed out waiting for tunnel frame")
            .expect("client closed the tunnel");
        Envelope::decode(&frame).expect("client sent a malformed frame")
    }

    /// Next envelope from the client that is not an ack
    pub async fn recv(&mut self) -> Envelope {
        loop {
            let envelope = self.recv_envelope().await;
            if envelope.kind != MessageKind::Ack {
                return envelope;
            }
        }
    }

    /// Asserts nothing but acks arrives for a short while
    pub async fn assert_quiet(&mut self) {
        let deadline = Instant::now() + Duration::from_millis(100);
        loop {
            match tokio::time::timeout_at(deadline, self.socket.receiver.recv()).await {
                Err(_) => return,
                Ok(None) => panic!("client closed the tunnel"),
                Ok(Some(frame)) => {
                    let envelope = Envelope::decode(&frame).expect("malformed frame");
                    assert_eq!(envelope.kind, MessageKind::Ack, "unexpected {:?}", envelope);
                }
            }
        }
    }

    /// Every envelope the client sends until it drops the connection
    pub async fn recv_until_closed(&mut self) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        loop {
            let frame = tokio::time::timeout(WAIT, self.socket.receiver.recv())
                .await
                .expect("timed out waiting for tunnel close");
            match frame {
                Some(frame) => envelopes
                    .push(Envelope::decode(&frame).expect("client sent a malformed frame")),
                None => return envelopes,
            }
        }
    }

    /// Resolves once the client has dropped its end of the connection
    pub async fn closed(&mut self) {
        loop {
            let frame = tokio::time::timeout(WAIT, self.socket.receiver.recv())
                .await
                .expect("timed out waiting for tunnel close");
            if frame.is_none() {
                return;
            }
        }
    }
}

pub fn test_config() -> TunnelConfig {
    TunnelConfig::builder()
        .url("ws://gateway.test/tunnel")
        .build()
        .expect("valid config")
}

pub async fn wait_connected(client: &TunnelClient) {
    tokio::time::timeout(WAIT, async {
        while !client.is_connected() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("timed out waiting for client to connect");
}

/// Started client with `ACTOR` registered and its live gateway connection
pub async fn connected_client(
    handlers: Option<TunnelHandlers>,
) -> (TunnelClient, Gateway, GatewayConnection) {
    connected_client_with(test_config(), handlers).await
}

pub async fn connected_client_with(
    config: TunnelConfig,
    handlers: Option<TunnelHandlers>,
) -> (TunnelClient, Gateway, GatewayConnection) {
    init_tracing();
    let (connector, mut gateway) = memory_gateway();
    let client = TunnelClient::with_connector(config, connector);
    if let Some(handlers) = handlers {
        client.set_handlers(handlers);
    }
    client.register_actor(ACTOR);
    client.start();

    let connection = gateway.accept().await;
    wait_connected(&client).await;
    (client, gateway, connection)
}

pub fn request_start(
    actor_id: &str,
    method: &str,
    path: &str,
    body: Option<&'static str>,
    stream: bool,
) -> MessageKind {
    MessageKind::ToServerRequestStart(actor_tunnel_proto::ToServerRequestStart {
        actor_id: actor_id.to_string(),
        method: method.to_string(),
        path: path.to_string(),
        headers: Headers::new(),
        body: body.map(|body| Bytes::from_static(body.as_bytes())),
        stream,
    })
}
