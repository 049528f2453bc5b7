//! Actor tunnel runner - echo actors behind a gateway tunnel
//!
//! Connects to a gateway and serves a set of echo actors through it, with
//! automatic reconnection.

use actor_tunnel_client::{
    Body, ConnectionListener, FetchHandler, HandlerError, ReconnectConfig, TunnelClient,
    TunnelConfig, TunnelHandlers, WebSocketAdapter, WebSocketEvent,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use http::{Request, Response};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Actor tunnel - serve local actors through a gateway tunnel
#[derive(Parser, Debug)]
#[command(name = "actor-tunnel")]
#[command(about = "Serve local actors through a gateway tunnel")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to a gateway and serve echo actors
    #[command(long_about = r#"
Connect to a gateway and serve echo actors through the tunnel. HTTP
requests are answered with their own body; WebSocket messages are sent
back to the peer. Reconnects automatically if the connection drops.

EXAMPLES:
  # Serve two actors through a local gateway
  actor-tunnel run --endpoint http://127.0.0.1:6420 \
    --namespace default \
    --actor actor-a --actor actor-b

  # Use a full tunnel URL
  actor-tunnel run --url "wss://gateway.example.com/tunnel?namespace=prod" \
    --actor echo

ENVIRONMENT VARIABLES:
  ACTOR_TUNNEL_URL        Full tunnel URL
  ACTOR_TUNNEL_ENDPOINT   Gateway endpoint the tunnel URL is derived from
  ACTOR_TUNNEL_NAMESPACE  Namespace
  ACTOR_TUNNEL_RUNNER_ID  Runner identifier
    "#)]
    Run {
        /// Full tunnel URL (ws:// or wss://)
        #[arg(long, env = "ACTOR_TUNNEL_URL", conflicts_with = "endpoint")]
        url: Option<String>,

        /// Gateway endpoint (e.g., https://gateway.example.com)
        #[arg(long, env = "ACTOR_TUNNEL_ENDPOINT", required_unless_present = "url")]
        endpoint: Option<String>,

        /// Namespace the runner belongs to
        #[arg(long, env = "ACTOR_TUNNEL_NAMESPACE", default_value = "default")]
        namespace: String,

        /// Runner identifier (random if not set)
        #[arg(long, env = "ACTOR_TUNNEL_RUNNER_ID")]
        runner_id: Option<String>,

        /// Actor to serve (repeatable)
        #[arg(long = "actor", required = true)]
        actors: Vec<String>,

        /// Initial reconnect delay in milliseconds
        #[arg(long, default_value = "1000")]
        initial_backoff_ms: u64,

        /// Maximum reconnect delay in milliseconds
        #[arg(long, default_value = "30000")]
        max_backoff_ms: u64,

        /// Give up after this many consecutive failed attempts (unlimited if not set)
        #[arg(long)]
        max_attempts: Option<usize>,

        /// Fail requests whose messages stay unacknowledged this long, in seconds
        #[arg(long)]
        ack_timeout_secs: Option<u64>,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Run {
            url,
            endpoint,
            namespace,
            runner_id,
            actors,
            initial_backoff_ms,
            max_backoff_ms,
            max_attempts,
            ack_timeout_secs,
        } => {
            let mut builder = TunnelConfig::builder()
                .reconnect(ReconnectConfig {
                    initial_backoff: Duration::from_millis(initial_backoff_ms),
                    max_backoff: Duration::from_millis(max_backoff_ms),
                    max_attempts,
                    ..ReconnectConfig::default()
                })
                .ack_timeout(ack_timeout_secs.map(Duration::from_secs));

            builder = match (url, endpoint) {
                (Some(url), _) => builder.url(url),
                (None, Some(endpoint)) => {
                    let runner_id =
                        runner_id.unwrap_or_else(|| format!("runner-{}", uuid::Uuid::new_v4()));
                    info!("Runner id: {}", runner_id);
                    builder
                        .endpoint(endpoint)
                        .namespace(namespace)
                        .runner_id(runner_id)
                }
                (None, None) => anyhow::bail!("either --url or --endpoint is required"),
            };

            let config = builder
                .build()
                .map_err(|e| anyhow::anyhow!(e))
                .context("Invalid tunnel configuration")?;

            run(config, actors).await
        }
        Commands::Version => {
            println!(
                "actor-tunnel {} ({}, built {})",
                env!("CARGO_PKG_VERSION"),
                env!("GIT_HASH"),
                env!("BUILD_TIME")
            );
            Ok(())
        }
    }
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn run(config: TunnelConfig, actors: Vec<String>) -> Result<()> {
    info!("Connecting to {}", config.url);

    let client = TunnelClient::new(config);
    client.set_handlers(
        TunnelHandlers::new(EchoActor)
            .with_websocket(echo_websocket)
            .with_connection_listener(LogConnection),
    );
    for actor_id in &actors {
        client.register_actor(actor_id.clone());
    }
    client.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("Received shutdown signal");
    for actor_id in &actors {
        client.unregister_actor(actor_id);
    }
    client.shutdown();

    Ok(())
}

/// Answers every request with its own body
struct EchoActor;

#[async_trait]
impl FetchHandler for EchoActor {
    async fn fetch(
        &self,
        actor_id: String,
        request: Request<Body>,
    ) -> Result<Response<Body>, HandlerError> {
        let (parts, body) = request.into_parts();
        info!("{} {} {}", actor_id, parts.method, parts.uri);

        let body = body.collect().await?;
        let mut builder = Response::builder().header("x-actor-id", actor_id);
        if let Some(content_type) = parts.headers.get(http::header::CONTENT_TYPE) {
            builder = builder.header(http::header::CONTENT_TYPE, content_type);
        }
        Ok(builder.body(Body::from(body))?)
    }
}

async fn echo_websocket(
    actor_id: String,
    websocket: WebSocketAdapter,
    request: Request<()>,
) -> Result<(), HandlerError> {
    info!("{} websocket {}", actor_id, request.uri());

    websocket.on_message(|ws, event| {
        if let WebSocketEvent::Message(data) = event {
            if let Err(e) = ws.send(data.clone()) {
                warn!("Echo failed on websocket {}: {}", ws.id(), e);
            }
        }
    });
    websocket.on_close(move |ws, event| {
        if let WebSocketEvent::Close(close) = event {
            info!("{} websocket {} closed: {} {}", actor_id, ws.id(), close.code, close.reason);
        }
    });

    Ok(())
}

struct LogConnection;

impl ConnectionListener for LogConnection {
    fn on_connected(&self) {
        info!("✅ Tunnel connected");
    }

    fn on_disconnected(&self) {
        warn!("Tunnel disconnected, reconnecting");
    }
}
