#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::ErrorCode;
use super::rooms::RoomRegistry;
use super::session::Session;
use crate::media::MediaServer;
use crate::metrics::ServerMetrics;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
const CHANNEL_CAPACITY: usize = 64;

/// Close the connection if nothing arrives within this window
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Token bucket burst capacity
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket refill, tokens per second
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// One token in microseconds, for integer math
const TOKEN_US: u64 = 1_000_000;

/// Per-connection token bucket
pub struct RateLimiter {
    tokens_us: u64,
    max_tokens_us: u64,
    refill_per_sec: u64,
    last_refill: Instant,
    warned: bool,
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allow,
    /// First rejection of a burst; the client should be told
    RejectAndWarn,
    Reject,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RATE_LIMIT_MAX_TOKENS, RATE_LIMIT_REFILL_RATE)
    }
}

impl RateLimiter {
    pub fn new(max_tokens: u64, refill_per_sec: u64) -> Self {
        Self {
            tokens_us: max_tokens * TOKEN_US,
            max_tokens_us: max_tokens * TOKEN_US,
            refill_per_sec,
            last_refill: Instant::now(),
            warned: false,
        }
    }

    pub fn check(&mut self) -> RateDecision {
        self.check_at(Instant::now())
    }

    fn check_at(&mut self, now: Instant) -> RateDecision {
        let elapsed_us = u64::try_from(now.saturating_duration_since(self.last_refill).as_micros()).unwrap_or(u64::MAX);
        self.last_refill = now;
        self.tokens_us = self
            .tokens_us
            .saturating_add(elapsed_us.saturating_mul(self.refill_per_sec))
            .min(self.max_tokens_us);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            self.warned = false;
            RateDecision::Allow
        } else if self.warned {
            RateDecision::Reject
        } else {
            self.warned = true;
            RateDecision::RejectAndWarn
        }
    }
}

/// Shared state handed to every connection
#[derive(Clone)]
pub struct ConnectionContext {
    pub media: Arc<MediaServer>,
    pub rooms: Arc<RoomRegistry>,
    pub metrics: ServerMetrics,
}

/// Handles a single WebSocket connection
pub async fn handle_connection(socket: WebSocket, context: ConnectionContext, _permit: OwnedSemaphorePermit) {
    let connection_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", connection_id);

    let metrics = context.metrics.clone();
    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let send_metrics = metrics.clone();
    let send_connection_id = connection_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for connection: {}", send_connection_id);
    });

    let session = Session::new(
        connection_id.clone(),
        tx,
        context.media,
        context.rooms,
        metrics.clone(),
    );
    session.greet();

    let mut limiter = RateLimiter::default();

    loop {
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!("WebSocket error for connection {}: {}", connection_id, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout for connection {}", connection_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                match limiter.check() {
                    RateDecision::Allow => {}
                    RateDecision::RejectAndWarn => {
                        warn!("Rate limit exceeded for connection {}", connection_id);
                        metrics.inc_rate_limited();
                        session.send_error(
                            None,
                            ErrorCode::RateLimited,
                            format!("Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} messages/second"),
                        );
                        continue;
                    }
                    RateDecision::Reject => {
                        metrics.inc_rate_limited();
                        continue;
                    }
                }

                session.handle_text(text.as_str()).await;
            }
            Message::Close(_) => {
                info!("Client {} closed connection", connection_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Answered by axum
            }
            Message::Binary(_) => {
                warn!("Unexpected binary frame from client {}", connection_id);
                session.send_error(None, ErrorCode::InvalidRequest, "Binary frames are not supported");
            }
        }
    }

    // Inline cleanup: the socket is gone, so nothing may outlive this handler
    session.disconnect().await;

    // Last sender clone went with the session; the send task drains and exits
    if let Err(e) = send_task.await {
        warn!("Send task for connection {} ended abnormally: {}", connection_id, e);
    }

    info!("Connection handler finished for connection: {}", connection_id);
}
