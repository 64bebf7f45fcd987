#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication

use crate::media::{Direction, MediaError, MediaKind};
use serde::{Deserialize, Serialize};

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join a room (idempotent)
    JoinRoom { room: String },
    LeaveRoom { room: String },
    /// Relay an opaque payload to the other members of a room
    Signal {
        room: String,
        payload: serde_json::Value,
    },
    GetRtpCapabilities,
    CreateSendTransport,
    CreateRecvTransport,
    /// Connect transport with DTLS parameters
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        direction: Direction,
        dtls_parameters: serde_json::Value,
    },
    /// Produce media (audio/video) on the send transport
    #[serde(rename_all = "camelCase")]
    Produce {
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
        #[serde(default)]
        metadata: serde_json::Value,
    },
    CloseProducer { kind: MediaKind },
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First message on every connection
    #[serde(rename_all = "camelCase")]
    Welcome { connection_id: String },
    /// Reply to join-room, listing the other members
    RoomJoined { room: String, members: Vec<String> },
    RoomLeft { room: String },
    #[serde(rename_all = "camelCase")]
    UserJoined { room: String, connection_id: String },
    #[serde(rename_all = "camelCase")]
    UserLeft { room: String, connection_id: String },
    Signal {
        room: String,
        payload: serde_json::Value,
        sender: String,
    },
    #[serde(rename_all = "camelCase")]
    RtpCapabilities { rtp_capabilities: serde_json::Value },
    #[serde(rename_all = "camelCase")]
    TransportCreated {
        transport_id: String,
        direction: Direction,
        ice_parameters: serde_json::Value,
        ice_candidates: serde_json::Value,
        dtls_parameters: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    TransportConnected {
        transport_id: String,
        direction: Direction,
    },
    #[serde(rename_all = "camelCase")]
    ProducerCreated { producer_id: String, kind: MediaKind },
    ProducerClosed { kind: MediaKind },
    /// Error response, sent only to the originating client
    Error { code: ErrorCode, message: String },
}

/// Stable machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// Retry after a short delay
    EngineNotReady,
    TransportNotFound,
    DuplicateResource,
    HandshakeFailed,
    ProducerFailed,
    InvalidState,
    InvalidRequest,
    RateLimited,
    Internal,
}

impl From<&MediaError> for ErrorCode {
    fn from(error: &MediaError) -> Self {
        match error {
            // A dead worker looks like a restart window to clients
            MediaError::EngineNotReady | MediaError::WorkerFatal(_) => ErrorCode::EngineNotReady,
            MediaError::TransportNotFound { .. } => ErrorCode::TransportNotFound,
            MediaError::DuplicateResource(_) => ErrorCode::DuplicateResource,
            MediaError::HandshakeFailed(_) => ErrorCode::HandshakeFailed,
            MediaError::ProducerFailed(_) => ErrorCode::ProducerFailed,
            MediaError::InvalidState(_) => ErrorCode::InvalidState,
            MediaError::TransportFailed(_) | MediaError::Configuration(_) => ErrorCode::Internal,
        }
    }
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }
}

/// Splits a text frame into its optional `requestId` and the message.
/// The id is recovered even when the message itself is malformed so the
/// error reply can still be correlated.
pub fn decode(text: &str) -> (Option<u64>, Result<ClientMessage, serde_json::Error>) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return (None, Err(e)),
    };
    let request_id = value.get("requestId").and_then(serde_json::Value::as_u64);
    (request_id, serde_json::from_value(value))
}

/// Serializes a server message, tagging responses with their `requestId`
pub fn encode(request_id: Option<u64>, message: &ServerMessage) -> serde_json::Result<String> {
    let mut value = serde_json::to_value(message)?;
    if let (Some(id), Some(object)) = (request_id, value.as_object_mut()) {
        object.insert("requestId".to_string(), id.into());
    }
    serde_json::to_string(&value)
}
