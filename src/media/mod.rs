#![forbid(unsafe_code)]

// Media module - control plane over the native media engine
// Supervises the worker and owns the transport and producer registries

pub mod config;
pub mod engine;
#[cfg(feature = "mediasoup-engine")]
pub mod mediasoup_engine;
pub mod producer_registry;
pub mod supervisor;
#[cfg(test)]
pub(crate) mod testing;
pub mod transport_registry;
pub mod types;

pub use config::{MediaConfig, RouterConfig, WebRtcTransportConfig, WorkerConfig};
pub use engine::{EngineEvent, MediaEngine};
#[cfg(feature = "mediasoup-engine")]
pub use mediasoup_engine::MediasoupEngine;
pub use producer_registry::ProducerRegistry;
pub use supervisor::{EngineSupervisor, WorkerState};
pub use transport_registry::TransportRegistry;
pub use types::{Direction, MediaError, MediaKind, MediaResult, ProducerInfo, TransportInfo};

use engine::EngineEventSender;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::{Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-connection async locks. Every media operation of a connection runs
/// under its lock, so a connection's transports and producers change one
/// request at a time while different connections proceed in parallel.
#[derive(Default)]
struct ConnectionLocks {
    locks: StdRwLock<HashMap<String, Arc<TokioMutex<()>>>>,
}

impl ConnectionLocks {
    fn get(&self, connection_id: &str) -> Arc<TokioMutex<()>> {
        if let Some(lock) = self.existing(connection_id) {
            return lock;
        }
        let mut locks = self.locks.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(connection_id.to_string()).or_default())
    }

    fn existing(&self, connection_id: &str) -> Option<Arc<TokioMutex<()>>> {
        let locks = self.locks.read().unwrap_or_else(|e| e.into_inner());
        locks.get(connection_id).cloned()
    }

    fn remove(&self, connection_id: &str) {
        let mut locks = self.locks.write().unwrap_or_else(|e| e.into_inner());
        locks.remove(connection_id);
    }
}

/// Counts exposed on the health endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStats {
    pub engine: WorkerState,
    pub generation: u64,
    pub worker_restarts: u64,
    pub transports: usize,
    pub producers: usize,
}

/// Main MediaServer struct that coordinates all engine operations
pub struct MediaServer {
    supervisor: Arc<EngineSupervisor>,
    transports: Arc<TransportRegistry>,
    producers: Arc<ProducerRegistry>,
    connections: Arc<ConnectionLocks>,
    config: Arc<MediaConfig>,
    events: EngineEventSender,
    cancel: CancellationToken,
    event_task: StdMutex<Option<JoinHandle<()>>>,
}

impl MediaServer {
    /// Wires the components together and starts the supervision task.
    /// The worker is not started until `initialize`.
    pub fn new(engine: Arc<dyn MediaEngine>, config: MediaConfig) -> Self {
        let config = Arc::new(config);
        let (events, event_rx) = mpsc::unbounded_channel();

        let supervisor = Arc::new(EngineSupervisor::new(engine, Arc::clone(&config), events.clone()));
        let transports = Arc::new(TransportRegistry::new());
        let producers = Arc::new(ProducerRegistry::new());
        let connections = Arc::new(ConnectionLocks::default());
        let cancel = CancellationToken::new();

        let supervision = Supervision {
            supervisor: Arc::clone(&supervisor),
            transports: Arc::clone(&transports),
            producers: Arc::clone(&producers),
            connections: Arc::clone(&connections),
            config: Arc::clone(&config),
            cancel: cancel.clone(),
        };
        let event_task = tokio::spawn(supervision.run(event_rx));

        Self {
            supervisor,
            transports,
            producers,
            connections,
            config,
            events,
            cancel,
            event_task: StdMutex::new(Some(event_task)),
        }
    }

    /// Starts the worker and its router.
    ///
    /// # Errors
    /// Returns `MediaError::WorkerFatal` if the engine cannot be brought up
    pub async fn initialize(&self) -> MediaResult<()> {
        info!(
            "Initializing media engine with {} codecs",
            self.config.router_config.media_codecs.len()
        );
        self.supervisor.initialize().await
    }

    /// Router capability set, identical across worker restarts
    pub fn rtp_capabilities(&self) -> MediaResult<serde_json::Value> {
        self.supervisor.capabilities()
    }

    pub async fn create_transport(&self, connection_id: &str, direction: Direction) -> MediaResult<TransportInfo> {
        let handle = self.supervisor.handle()?;
        let lock = self.connections.get(connection_id);
        let _guard = lock.lock().await;

        let info = self
            .transports
            .create_transport(
                connection_id,
                direction,
                &handle,
                &self.config.webrtc_transport_config,
                self.events.clone(),
            )
            .await?;

        // The worker may have died while the transport was being created
        if !self.supervisor.is_current(handle.generation()) {
            self.transports.close(connection_id, direction);
            return Err(MediaError::EngineNotReady);
        }
        Ok(info)
    }

    /// Completes the DTLS handshake; returns the transport id
    pub async fn connect_transport(
        &self,
        connection_id: &str,
        direction: Direction,
        dtls_parameters: serde_json::Value,
    ) -> MediaResult<String> {
        let handle = self.supervisor.handle()?;
        let lock = self.connections.get(connection_id);
        let _guard = lock.lock().await;

        self.transports
            .connect_transport(connection_id, direction, dtls_parameters, handle.generation())
            .await
    }

    pub async fn produce(
        &self,
        connection_id: &str,
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
        app_data: serde_json::Value,
    ) -> MediaResult<ProducerInfo> {
        let handle = self.supervisor.handle()?;
        let lock = self.connections.get(connection_id);
        let _guard = lock.lock().await;

        let info = self
            .producers
            .produce(
                &self.transports,
                connection_id,
                kind,
                rtp_parameters,
                app_data,
                handle.generation(),
            )
            .await?;

        // Registered after the worker died but before its producers were purged
        if !self.supervisor.is_current(handle.generation()) {
            self.producers.close(connection_id, kind);
            return Err(MediaError::EngineNotReady);
        }
        Ok(info)
    }

    /// Closes one producer; false if there was none
    pub async fn close_producer(&self, connection_id: &str, kind: MediaKind) -> bool {
        let lock = self.connections.get(connection_id);
        let _guard = lock.lock().await;
        self.producers.close(connection_id, kind).is_some()
    }

    /// Releases every engine resource owned by the connection:
    /// producers first, then its transports.
    pub async fn release_connection(&self, connection_id: &str) {
        let lock = self.connections.get(connection_id);
        {
            let _guard = lock.lock().await;
            let producers = self.producers.close_all(connection_id);
            let transports = Direction::ALL
                .iter()
                .filter(|direction| self.transports.close(connection_id, **direction))
                .count();
            debug!(
                "Released connection {}: {} producers, {} transports",
                connection_id, producers, transports
            );
        }
        self.connections.remove(connection_id);
    }

    pub fn supervisor(&self) -> &EngineSupervisor {
        &self.supervisor
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    pub fn producers(&self) -> &ProducerRegistry {
        &self.producers
    }

    pub fn stats(&self) -> MediaStats {
        MediaStats {
            engine: self.supervisor.state(),
            generation: self.supervisor.generation(),
            worker_restarts: self.supervisor.restart_count(),
            transports: self.transports.len(),
            producers: self.producers.len(),
        }
    }

    /// Releases producers, transports, router and worker, in that order,
    /// then stops the supervision task
    pub async fn shutdown(&self) {
        info!("Shutting down MediaServer");
        self.cancel.cancel();

        let producers = self.producers.clear();
        let transports = self.transports.close_all();
        debug!("Released {} producers and {} transports", producers, transports);

        self.supervisor.shutdown();

        let task = self.event_task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Supervision task ended abnormally: {}", e);
            }
        }

        info!("MediaServer shutdown complete");
    }
}

impl Drop for MediaServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// State owned by the background task reacting to engine events
struct Supervision {
    supervisor: Arc<EngineSupervisor>,
    transports: Arc<TransportRegistry>,
    producers: Arc<ProducerRegistry>,
    connections: Arc<ConnectionLocks>,
    config: Arc<MediaConfig>,
    cancel: CancellationToken,
}

impl Supervision {
    async fn run(self, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
        let mut sweep = tokio::time::interval(self.config.supervision.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(EngineEvent::WorkerDied { worker_id, reason }) => {
                        self.on_worker_died(&worker_id, &reason).await;
                    }
                    Some(EngineEvent::DtlsStateChanged { transport_id, state }) => {
                        if state.is_terminal() {
                            self.on_transport_lost(&transport_id, state).await;
                        } else {
                            debug!("DTLS state {:?} for transport {}", state, transport_id);
                        }
                    }
                    None => break,
                },
                _ = sweep.tick() => {
                    self.transports.expire_handshakes(self.config.supervision.connect_timeout);
                }
            }
        }

        debug!("Media supervision task stopped");
    }

    async fn on_worker_died(&self, worker_id: &str, reason: &str) {
        let Some(retired) = self.supervisor.mark_died(worker_id) else {
            debug!("Worker {} is not the live worker; nothing to retire", worker_id);
            return;
        };

        error!("Media worker {} died ({}); discarding its resources", worker_id, reason);
        let producers = self.producers.clear();
        let transports = self.transports.close_all();
        retired.release();
        warn!(
            "Dropped {} transports and {} producers of dead worker {}",
            transports, producers, worker_id
        );

        if !self.supervisor.restart(&self.cancel).await {
            warn!("Media worker restart abandoned");
        }
    }

    async fn on_transport_lost(&self, transport_id: &str, state: types::DtlsState) {
        let Some(snapshot) = self.transports.find_by_id(transport_id) else {
            return;
        };
        let connection_id = snapshot.connection_id;

        // A released connection has no lock left and nothing to race with
        let lock = self.connections.existing(&connection_id);
        let _guard = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        if snapshot.direction == Direction::Send {
            self.producers.close_all(&connection_id);
        }
        if self.transports.close_by_id(transport_id).is_some() {
            warn!(
                "Transport {} of connection {} lost DTLS ({:?})",
                transport_id, connection_id, state
            );
        }
    }
}
