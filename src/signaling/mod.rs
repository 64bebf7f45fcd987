#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod protocol;
pub mod rooms;
pub mod session;

use crate::media::{MediaServer, WorkerState};
use crate::metrics::{LiveGauges, ServerMetrics};
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use connection::ConnectionContext;
use rooms::RoomRegistry;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Largest accepted WebSocket frame
const MAX_MESSAGE_SIZE: usize = 65_536;

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    media: Arc<MediaServer>,
    rooms: Arc<RoomRegistry>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    metrics_token: Option<Arc<str>>,
}

impl SignalingServer {
    /// Creates a new signaling server; reads `MAX_CONNECTIONS` and `METRICS_TOKEN`
    pub fn new(media: Arc<MediaServer>, metrics: ServerMetrics) -> Self {
        let mut max_connections: usize = std::env::var("MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default {}", DEFAULT_MAX_CONNECTIONS);
            max_connections = DEFAULT_MAX_CONNECTIONS;
        }
        info!("Max connections: {}", max_connections);

        let metrics_token = std::env::var("METRICS_TOKEN").ok().map(Arc::from);
        if metrics_token.is_some() {
            info!("Metrics endpoint requires a bearer token");
        }

        Self::with_limits(media, metrics, max_connections, metrics_token)
    }

    pub fn with_limits(
        media: Arc<MediaServer>,
        metrics: ServerMetrics,
        max_connections: usize,
        metrics_token: Option<Arc<str>>,
    ) -> Self {
        Self {
            media,
            rooms: Arc::new(RoomRegistry::new()),
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            metrics_token,
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Serves until `shutdown` resolves
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

        Ok(())
    }

    fn live_gauges(&self) -> LiveGauges {
        let stats = self.media.stats();
        LiveGauges {
            rooms: self.rooms.room_count(),
            transports: stats.transports,
            producers: stats.producers,
            worker_restarts: stats.worker_restarts,
            engine_running: stats.engine == WorkerState::Running,
        }
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Response {
    let stats = server.media.stats();
    let running = stats.engine == WorkerState::Running;
    let body = Json(serde_json::json!({
        "status": if running { "ok" } else { "degraded" },
        "media": stats,
        "rooms": server.rooms.room_count(),
        "connections": server.metrics.connections_active(),
    }));

    let status = if running { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, body).into_response()
}

/// Prometheus text exposition, behind an optional bearer token
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = &server.metrics_token {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or("");
        if provided != expected.as_ref() {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let body = server.metrics.render_prometheus(server.live_gauges());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    // Non-blocking: a full gateway answers 503 right away
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    let context = ConnectionContext {
        media: server.media,
        rooms: server.rooms,
        metrics: server.metrics,
    };

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| connection::handle_connection(socket, context, permit))
}
