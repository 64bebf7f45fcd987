#![forbid(unsafe_code)]

// In-process engine double for unit tests

use crate::media::config::{CodecSpec, MediaConfig, RouterConfig, WebRtcTransportConfig, WorkerConfig};
use crate::media::engine::{
    EngineEvent, EngineEventSender, EngineProducer, EngineRouter, EngineTransport, EngineWorker, MediaEngine,
};
use crate::media::types::{DtlsState, MediaError, MediaKind, MediaResult, TransportParameters};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Short timings so supervision paths run quickly under test
pub fn test_config() -> MediaConfig {
    let mut config = MediaConfig::default();
    config.supervision.sweep_interval = Duration::from_millis(20);
    config.supervision.restart_backoff = Duration::from_millis(5);
    config.supervision.restart_backoff_max = Duration::from_millis(20);
    config
}

/// Polls `check` until it holds, panicking after roughly two seconds
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[derive(Default)]
struct FakeState {
    next_id: AtomicU64,
    worker_start_failures: AtomicUsize,
    fail_connect: AtomicBool,
    fail_produce: AtomicBool,
    die_during_router_creation: AtomicBool,
    workers_started: AtomicUsize,
    live_workers: AtomicUsize,
    live_routers: AtomicUsize,
    live_transports: AtomicUsize,
    live_producers: AtomicUsize,
    worker: Mutex<Option<(String, EngineEventSender)>>,
    transport_events: Mutex<HashMap<String, EngineEventSender>>,
    releases: Mutex<Vec<&'static str>>,
}

impl FakeState {
    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn released(&self, what: &'static str, live: &AtomicUsize) {
        live.fetch_sub(1, Ordering::SeqCst);
        self.releases.lock().unwrap().push(what);
    }
}

/// Engine whose resources are plain counters. Cloning shares state.
#[derive(Clone, Default)]
pub struct FakeEngine {
    state: Arc<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` worker starts fail
    pub fn fail_worker_starts(&self, n: usize) {
        self.state.worker_start_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_connects(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_produces(&self, fail: bool) {
        self.state.fail_produce.store(fail, Ordering::SeqCst);
    }

    /// The next router creation reports its worker dead and stalls briefly,
    /// as a worker crashing mid-startup would
    pub fn die_during_router_creation(&self) {
        self.state.die_during_router_creation.store(true, Ordering::SeqCst);
    }

    pub fn current_worker_id(&self) -> Option<String> {
        self.state.worker.lock().unwrap().as_ref().map(|(id, _)| id.clone())
    }

    /// Reports the current worker as dead, the way a crashed process would
    pub fn kill_worker(&self) -> bool {
        let worker = self.state.worker.lock().unwrap().clone();
        match worker {
            Some((worker_id, events)) => events
                .send(EngineEvent::WorkerDied {
                    worker_id,
                    reason: "killed by test".to_string(),
                })
                .is_ok(),
            None => false,
        }
    }

    pub fn set_dtls_state(&self, transport_id: &str, state: DtlsState) -> bool {
        let events = self.state.transport_events.lock().unwrap().get(transport_id).cloned();
        match events {
            Some(events) => events
                .send(EngineEvent::DtlsStateChanged {
                    transport_id: transport_id.to_string(),
                    state,
                })
                .is_ok(),
            None => false,
        }
    }

    pub fn workers_started(&self) -> usize {
        self.state.workers_started.load(Ordering::SeqCst)
    }

    pub fn live_workers(&self) -> usize {
        self.state.live_workers.load(Ordering::SeqCst)
    }

    pub fn live_routers(&self) -> usize {
        self.state.live_routers.load(Ordering::SeqCst)
    }

    pub fn live_transports(&self) -> usize {
        self.state.live_transports.load(Ordering::SeqCst)
    }

    pub fn live_producers(&self) -> usize {
        self.state.live_producers.load(Ordering::SeqCst)
    }

    /// Kinds of released resources, in release order
    pub fn releases(&self) -> Vec<&'static str> {
        self.state.releases.lock().unwrap().clone()
    }

    pub fn clear_releases(&self) {
        self.state.releases.lock().unwrap().clear();
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn start_worker(
        &self,
        _config: &WorkerConfig,
        events: EngineEventSender,
    ) -> MediaResult<Box<dyn EngineWorker>> {
        let failures = &self.state.worker_start_failures;
        if failures.load(Ordering::SeqCst) > 0 {
            let _ = failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            return Err(MediaError::WorkerFatal("worker binary refused to start".to_string()));
        }

        let id = self.state.next_id("worker");
        *self.state.worker.lock().unwrap() = Some((id.clone(), events));
        self.state.workers_started.fetch_add(1, Ordering::SeqCst);
        self.state.live_workers.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(FakeWorker {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeWorker {
    id: String,
    state: Arc<FakeState>,
}

#[async_trait]
impl EngineWorker for FakeWorker {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn create_router(&self, config: &RouterConfig) -> MediaResult<Box<dyn EngineRouter>> {
        if self.state.die_during_router_creation.swap(false, Ordering::SeqCst) {
            let events = self.state.worker.lock().unwrap().as_ref().map(|(_, events)| events.clone());
            if let Some(events) = events {
                let _ = events.send(EngineEvent::WorkerDied {
                    worker_id: self.id.clone(),
                    reason: "crashed during startup".to_string(),
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.state.live_routers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeRouter {
            id: self.state.next_id("router"),
            codecs: config.media_codecs.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

impl Drop for FakeWorker {
    fn drop(&mut self) {
        self.state.released("worker", &self.state.live_workers);
    }
}

struct FakeRouter {
    id: String,
    codecs: Vec<CodecSpec>,
    state: Arc<FakeState>,
}

#[async_trait]
impl EngineRouter for FakeRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> MediaResult<serde_json::Value> {
        Ok(json!({ "codecs": self.codecs, "headerExtensions": [] }))
    }

    async fn create_webrtc_transport(
        &self,
        _config: &WebRtcTransportConfig,
        events: EngineEventSender,
    ) -> MediaResult<Box<dyn EngineTransport>> {
        let id = self.state.next_id("transport");
        self.state
            .transport_events
            .lock()
            .unwrap()
            .insert(id.clone(), events);
        self.state.live_transports.fetch_add(1, Ordering::SeqCst);

        let parameters = TransportParameters {
            ice_parameters: json!({ "usernameFragment": format!("ufrag-{id}"), "password": "secret", "iceLite": true }),
            ice_candidates: json!([{ "foundation": "udpcandidate", "ip": "127.0.0.1", "port": 10000, "protocol": "udp" }]),
            dtls_parameters: json!({ "role": "auto", "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD" }] }),
        };

        Ok(Box::new(FakeTransport {
            id,
            parameters,
            state: Arc::clone(&self.state),
        }))
    }
}

impl Drop for FakeRouter {
    fn drop(&mut self) {
        self.state.released("router", &self.state.live_routers);
    }
}

struct FakeTransport {
    id: String,
    parameters: TransportParameters,
    state: Arc<FakeState>,
}

#[async_trait]
impl EngineTransport for FakeTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn parameters(&self) -> &TransportParameters {
        &self.parameters
    }

    async fn connect(&self, dtls_parameters: serde_json::Value) -> MediaResult<()> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(MediaError::HandshakeFailed("fingerprint mismatch".to_string()));
        }
        if dtls_parameters.get("fingerprints").is_none() {
            return Err(MediaError::TransportFailed("missing fingerprints".to_string()));
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        _rtp_parameters: serde_json::Value,
        _app_data: serde_json::Value,
    ) -> MediaResult<Box<dyn EngineProducer>> {
        if self.state.fail_produce.load(Ordering::SeqCst) {
            return Err(MediaError::ProducerFailed("unsupported codec".to_string()));
        }
        self.state.live_producers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeProducer {
            id: self.state.next_id("producer"),
            kind,
            state: Arc::clone(&self.state),
        }))
    }
}

impl Drop for FakeTransport {
    fn drop(&mut self) {
        self.state.transport_events.lock().unwrap().remove(&self.id);
        self.state.released("transport", &self.state.live_transports);
    }
}

struct FakeProducer {
    id: String,
    kind: MediaKind,
    state: Arc<FakeState>,
}

impl EngineProducer for FakeProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }
}

impl Drop for FakeProducer {
    fn drop(&mut self) {
        self.state.released("producer", &self.state.live_producers);
    }
}

/// Client-side DTLS parameters accepted by the fake transport
pub fn client_dtls() -> serde_json::Value {
    json!({ "role": "client", "fingerprints": [{ "algorithm": "sha-256", "value": "12:34" }] })
}

pub fn client_rtp(kind: MediaKind) -> serde_json::Value {
    match kind {
        MediaKind::Audio => json!({ "codecs": [{ "mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000, "channels": 2 }], "encodings": [{ "ssrc": 1111 }] }),
        MediaKind::Video => json!({ "codecs": [{ "mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000 }], "encodings": [{ "ssrc": 2222 }] }),
    }
}
