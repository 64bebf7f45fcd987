#![forbid(unsafe_code)]

// Common types and error handling for the media module

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Custom error type for media operations
#[derive(Error, Debug)]
pub enum MediaError {
    /// Worker or router unavailable (startup or restart window). Retryable.
    #[error("Media engine not ready")]
    EngineNotReady,

    #[error("No {direction} transport for connection {connection_id}")]
    TransportNotFound {
        connection_id: String,
        direction: Direction,
    },

    #[error("Resource already exists: {0}")]
    DuplicateResource(String),

    #[error("DTLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// The worker could not be started at all.
    #[error("Worker failed to start: {0}")]
    WorkerFatal(String),

    #[error("Producer error: {0}")]
    ProducerFailed(String),

    #[error("Transport error: {0}")]
    TransportFailed(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl MediaError {
    pub fn transport_not_found(connection_id: &str, direction: Direction) -> Self {
        Self::TransportNotFound {
            connection_id: connection_id.to_string(),
            direction,
        }
    }
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Transport direction, relative to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Recv,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Send, Direction::Recv];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Send => "send",
            Direction::Recv => "recv",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Transport lifecycle. `Closed` transports are removed from the registry, so a
/// snapshot only ever reports it for a transport that was closed mid-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Created,
    Connecting,
    Connected,
    Closed,
}

/// DTLS state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl DtlsState {
    /// States after which the transport can never carry media again
    pub fn is_terminal(&self) -> bool {
        matches!(self, DtlsState::Failed | DtlsState::Closed)
    }
}

/// Engine-defined connectivity parameters handed to the remote peer.
/// Contents are opaque to the control plane and forwarded as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParameters {
    pub ice_parameters: serde_json::Value,
    pub ice_candidates: serde_json::Value,
    pub dtls_parameters: serde_json::Value,
}

/// Transport information for signaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    pub direction: Direction,
    #[serde(flatten)]
    pub parameters: TransportParameters,
}

/// Point-in-time view of a registered transport
#[derive(Debug, Clone)]
pub struct TransportSnapshot {
    pub id: String,
    pub connection_id: String,
    pub direction: Direction,
    pub state: TransportState,
    pub generation: u64,
}

/// Producer information for signaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub id: String,
    pub kind: MediaKind,
    /// Id of the producer this one replaced, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaced: Option<String>,
}
