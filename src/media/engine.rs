#![forbid(unsafe_code)]

// Boundary with the native media-forwarding engine.
//
// The control plane never touches RTP; it only starts workers, creates routers,
// transports and producers, and reacts to the engine's asynchronous events.
// Every handle releases its engine resource when dropped.

use crate::media::config::{RouterConfig, WebRtcTransportConfig, WorkerConfig};
use crate::media::types::{DtlsState, MediaKind, MediaResult, TransportParameters};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Asynchronous notifications raised by the engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The worker process exited unexpectedly
    WorkerDied { worker_id: String, reason: String },
    DtlsStateChanged { transport_id: String, state: DtlsState },
}

/// Engine callbacks are synchronous, so events go through an unbounded channel
/// and never block the engine's notification thread.
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Starts a worker. `events` receives its death notification.
    async fn start_worker(
        &self,
        config: &WorkerConfig,
        events: EngineEventSender,
    ) -> MediaResult<Box<dyn EngineWorker>>;
}

#[async_trait]
pub trait EngineWorker: Send + Sync {
    fn id(&self) -> String;

    async fn create_router(&self, config: &RouterConfig) -> MediaResult<Box<dyn EngineRouter>>;
}

#[async_trait]
pub trait EngineRouter: Send + Sync {
    fn id(&self) -> String;

    /// Negotiated capability set, in the engine's client-facing format
    fn rtp_capabilities(&self) -> MediaResult<serde_json::Value>;

    /// Creates an ICE/DTLS transport. `events` receives its DTLS state changes.
    async fn create_webrtc_transport(
        &self,
        config: &WebRtcTransportConfig,
        events: EngineEventSender,
    ) -> MediaResult<Box<dyn EngineTransport>>;
}

#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> String;

    fn parameters(&self) -> &TransportParameters;

    /// Completes the DTLS exchange with the remote peer's parameters
    async fn connect(&self, dtls_parameters: serde_json::Value) -> MediaResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
        app_data: serde_json::Value,
    ) -> MediaResult<Box<dyn EngineProducer>>;
}

pub trait EngineProducer: Send + Sync {
    fn id(&self) -> String;

    fn kind(&self) -> MediaKind;
}
