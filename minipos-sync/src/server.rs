//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Terminal A ──┐                        ┌──► Terminal B
//!              ├── RelayHub ── Mirror ──┤
//! Terminal C ──┘        │               └──► Terminal C
//!                       └── BroadcastGroup (one channel, filtered per socket)
//! ```
//!
//! One axum router serves both the WebSocket endpoint (`/ws`) and the JSON
//! health check (`/health`). Any other path is answered with 404.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;

use minipos_core::MergePolicy;

use crate::error::RelayError;
use crate::relay::RelayHub;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Path of the WebSocket endpoint
    pub ws_path: String,
    /// Path of the HTTP health check
    pub health_path: String,
    /// Frames buffered per connection before it lags and is dropped
    pub broadcast_capacity: usize,
    /// Cap on the mirror's sync log; unbounded when `None`
    pub sync_log_limit: Option<usize>,
    /// Add semantics used by the mirror
    pub merge_policy: MergePolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            ws_path: "/ws".to_string(),
            health_path: "/health".to_string(),
            broadcast_capacity: 1024,
            sync_log_limit: None,
            merge_policy: MergePolicy::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    /// Overrides defaults from the environment.
    ///
    /// - `MINIPOS_BIND`: full bind address, wins over `PORT`
    /// - `PORT`: port on `0.0.0.0`
    /// - `MINIPOS_WS_PATH`
    /// - `MINIPOS_BROADCAST_CAPACITY`
    /// - `MINIPOS_SYNC_LOG_LIMIT`
    pub fn from_env() -> Result<Self, RelayError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RelayError> {
        let mut config = Self::default();

        if let Some(bind) = lookup("MINIPOS_BIND") {
            config.bind_addr = bind;
        } else if let Some(port) = lookup("PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|_| RelayError::Config(format!("PORT must be a port number, got '{port}'")))?;
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(path) = lookup("MINIPOS_WS_PATH") {
            if !path.starts_with('/') {
                return Err(RelayError::Config(format!("MINIPOS_WS_PATH must start with '/', got '{path}'")));
            }
            config.ws_path = path;
        }
        if let Some(cap) = lookup("MINIPOS_BROADCAST_CAPACITY") {
            config.broadcast_capacity = parse_positive("MINIPOS_BROADCAST_CAPACITY", &cap)?;
        }
        if let Some(limit) = lookup("MINIPOS_SYNC_LOG_LIMIT") {
            config.sync_log_limit = Some(parse_positive("MINIPOS_SYNC_LOG_LIMIT", &limit)?);
        }
        Ok(config)
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<usize, RelayError> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(RelayError::Config(format!("{key} must be a positive integer, got '{raw}'"))),
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub relayed_messages: u64,
    pub rejected_frames: u64,
    pub frames_dropped: u64,
    /// Connections closed because they fell behind the broadcast channel
    pub dropped_peers: u64,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    hub: Arc<RelayHub>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(RelayHub::new(&config));
        Self { config, hub }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        log::info!(
            "Relay listening on {} (ws: {}, health: {})",
            listener.local_addr()?,
            self.config.ws_path,
            self.config.health_path
        );
        axum::serve(listener, self.router().into_make_service_with_connect_info::<SocketAddr>()).await?;
        Ok(())
    }

    /// The relay's routes, bound to this server's hub.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.config.ws_path, get(ws_upgrade))
            .route(&self.config.health_path, get(health_check))
            .layer(CorsLayer::permissive())
            .with_state(self.hub.clone())
    }

    pub async fn stats(&self) -> ServerStats {
        self.hub.stats().await
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }
}

/// GET /health
async fn health_check(State(hub): State<Arc<RelayHub>>) -> Json<Value> {
    Json(hub.health().await)
}

/// GET /ws: upgrade to WebSocket
async fn ws_upgrade(
    State(hub): State<Arc<RelayHub>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = handle_socket(socket, addr, hub).await {
            log::error!("Connection error from {addr}: {e}");
        }
    })
}

/// Drives one WebSocket until it closes, fails, or falls behind.
async fn handle_socket(socket: WebSocket, addr: SocketAddr, hub: Arc<RelayHub>) -> Result<(), RelayError> {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (peer, mut frames) = hub.connect(Some(addr)).await;
    let conn_id = peer.conn_id;

    let result: Result<(), RelayError> = async {
        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            hub.handle_frame(conn_id, text.as_str()).await;
                        }
                        Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                            Ok(text) => hub.handle_frame(conn_id, text).await,
                            Err(_) => hub.reject(conn_id, "Invalid message format: binary frame is not UTF-8").await,
                        },
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("{} closed the socket", peer.connection_id());
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("Socket error on {}: {e}", peer.connection_id());
                            break;
                        }
                        Some(Ok(Message::Pong(_))) => {}
                    }
                }

                // Outgoing relay frame
                frame = frames.recv() => {
                    match frame {
                        Ok(frame) => {
                            if frame.is_for(conn_id) {
                                ws_sender.send(Message::Text(frame.text.clone().into())).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            // Missed mutations cannot be replayed. Dropping the
                            // socket makes the terminal reconnect and resync.
                            hub.drop_lagging(conn_id, n).await;
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    hub.disconnect(conn_id).await;
    result
}
