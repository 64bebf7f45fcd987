#![forbid(unsafe_code)]

// Worker + router lifecycle: bootstrap, death detection and restart

use crate::media::config::MediaConfig;
use crate::media::engine::{EngineEventSender, EngineRouter, EngineWorker, MediaEngine};
use crate::media::types::{MediaError, MediaResult};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Running,
    Died,
    Stopped,
}

/// Router reference tagged with the engine generation it belongs to.
///
/// Handles are cheap to clone and are what the registries create transports
/// against. A handle from an earlier generation is stale once the worker restarts.
#[derive(Clone)]
pub struct EngineHandle {
    generation: u64,
    router: Arc<dyn EngineRouter>,
}

impl EngineHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn router(&self) -> &dyn EngineRouter {
        self.router.as_ref()
    }
}

struct ActiveEngine {
    worker_id: String,
    router: Arc<dyn EngineRouter>,
    worker: Box<dyn EngineWorker>,
}

impl ActiveEngine {
    /// Router first, then the worker that hosts it
    fn release(self) {
        let ActiveEngine { worker_id, router, worker } = self;
        drop(router);
        debug!("Released router of worker {}", worker_id);
        drop(worker);
        debug!("Released worker {}", worker_id);
    }
}

/// Worker taken out of service by its death, not yet released.
///
/// Holding it lets the caller drop the resources built on the worker before
/// the router and the worker themselves go.
pub struct RetiredEngine(ActiveEngine);

impl RetiredEngine {
    pub fn worker_id(&self) -> &str {
        &self.0.worker_id
    }

    /// Releases router then worker
    pub fn release(self) {
        self.0.release();
    }
}

/// Worker spawned by an in-flight `initialize` whose router is not ready yet
struct StartingWorker {
    worker_id: String,
    died: bool,
}

struct SupervisorState {
    state: WorkerState,
    active: Option<ActiveEngine>,
    starting: Option<StartingWorker>,
    generation: u64,
}

/// Owns the single worker and its router.
///
/// State lives behind a std RwLock that is never held across an await; the
/// async restart mutex makes sure only one start attempt runs at a time.
pub struct EngineSupervisor {
    engine: Arc<dyn MediaEngine>,
    config: Arc<MediaConfig>,
    events: EngineEventSender,
    inner: StdRwLock<SupervisorState>,
    restart_lock: TokioMutex<()>,
    restarts: AtomicU64,
}

impl EngineSupervisor {
    pub fn new(engine: Arc<dyn MediaEngine>, config: Arc<MediaConfig>, events: EngineEventSender) -> Self {
        Self {
            engine,
            config,
            events,
            inner: StdRwLock::new(SupervisorState {
                state: WorkerState::Starting,
                active: None,
                starting: None,
                generation: 0,
            }),
            restart_lock: TokioMutex::new(()),
            restarts: AtomicU64::new(0),
        }
    }

    /// Starts the worker and its router. A no-op if already running.
    ///
    /// # Errors
    /// Returns `MediaError::WorkerFatal` if the worker or router cannot be created,
    /// and `MediaError::InvalidState` after shutdown
    pub async fn initialize(&self) -> MediaResult<()> {
        let _restart_guard = self.restart_lock.lock().await;

        {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            match inner.state {
                WorkerState::Running => return Ok(()),
                WorkerState::Stopped => {
                    return Err(MediaError::InvalidState("Media engine is shut down".to_string()))
                }
                WorkerState::Starting | WorkerState::Died => inner.state = WorkerState::Starting,
            }
        }

        let worker_config = &self.config.worker_config;
        info!(
            "Starting media worker (ports {}-{}, log level {:?})",
            worker_config.rtc_min_port, worker_config.rtc_max_port, worker_config.log_level
        );

        // No lock held while the engine works
        let started = self.start_engine().await;

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let died_while_starting = inner.starting.take().map_or(false, |starting| starting.died);
        if inner.state == WorkerState::Stopped {
            // Shut down while starting; the fresh worker is released on drop
            return Err(MediaError::InvalidState("Media engine is shut down".to_string()));
        }

        match started {
            Ok(active) if died_while_starting => {
                inner.state = WorkerState::Died;
                drop(inner);
                error!("Media worker {} died before its router was ready", active.worker_id);
                let worker_id = active.worker_id.clone();
                active.release();
                Err(MediaError::WorkerFatal(format!("Worker {worker_id} died during startup")))
            }
            Ok(active) => {
                inner.generation += 1;
                info!(
                    "Media engine running: worker {} (generation {})",
                    active.worker_id, inner.generation
                );
                inner.active = Some(active);
                inner.state = WorkerState::Running;
                Ok(())
            }
            Err(e) => {
                inner.state = WorkerState::Died;
                Err(e)
            }
        }
    }

    async fn start_engine(&self) -> MediaResult<ActiveEngine> {
        let worker = self
            .engine
            .start_worker(&self.config.worker_config, self.events.clone())
            .await
            .map_err(|e| match e {
                MediaError::WorkerFatal(_) => e,
                other => MediaError::WorkerFatal(other.to_string()),
            })?;
        let worker_id = worker.id();

        // Its death may be reported before the router exists
        self.inner.write().unwrap_or_else(|e| e.into_inner()).starting = Some(StartingWorker {
            worker_id: worker_id.clone(),
            died: false,
        });

        let router = worker
            .create_router(&self.config.router_config)
            .await
            .map_err(|e| MediaError::WorkerFatal(format!("Failed to create router on worker {worker_id}: {e}")))?;

        debug!("Created router {} on worker {}", router.id(), worker_id);

        Ok(ActiveEngine {
            worker_id,
            router: Arc::from(router),
            worker,
        })
    }

    /// Handle to the live router.
    ///
    /// # Errors
    /// Returns `MediaError::EngineNotReady` unless the worker is running
    pub fn handle(&self) -> MediaResult<EngineHandle> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        match (&inner.state, &inner.active) {
            (WorkerState::Running, Some(active)) => Ok(EngineHandle {
                generation: inner.generation,
                router: Arc::clone(&active.router),
            }),
            _ => Err(MediaError::EngineNotReady),
        }
    }

    /// Router capability set.
    ///
    /// # Errors
    /// Returns `MediaError::EngineNotReady` unless the worker is running
    pub fn capabilities(&self) -> MediaResult<serde_json::Value> {
        self.handle()?.router().rtp_capabilities()
    }

    /// Whether `generation` is the one currently serving requests
    pub fn is_current(&self, generation: u64) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.state == WorkerState::Running && inner.generation == generation
    }

    pub fn state(&self) -> WorkerState {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).generation
    }

    /// Number of successful restarts after a worker death
    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Records the death of `worker_id` and takes it out of service.
    ///
    /// Returns the retired router and worker for the caller to release, or
    /// `None` if the notification is not about the live worker (already
    /// replaced, released during shutdown, or still starting). A worker that
    /// dies while starting makes the pending `initialize` fail instead.
    pub fn mark_died(&self, worker_id: &str) -> Option<RetiredEngine> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.state == WorkerState::Stopped {
            return None;
        }

        if let Some(starting) = inner.starting.as_mut().filter(|s| s.worker_id == worker_id) {
            starting.died = true;
            warn!("Media worker {} died while starting", worker_id);
            return None;
        }

        let is_live = inner
            .active
            .as_ref()
            .map_or(false, |active| active.worker_id == worker_id);
        if !is_live {
            return None;
        }

        error!("Media worker {} died", worker_id);
        inner.state = WorkerState::Died;
        inner.active.take().map(RetiredEngine)
    }

    /// Re-runs `initialize` until it succeeds, backing off exponentially.
    /// Returns false if cancelled or shut down first.
    pub async fn restart(&self, cancel: &CancellationToken) -> bool {
        let supervision = &self.config.supervision;
        let mut backoff = supervision.restart_backoff;

        loop {
            if cancel.is_cancelled() {
                return false;
            }

            match self.initialize().await {
                Ok(()) => {
                    let restarts = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
                    info!("Media worker restarted (restart #{})", restarts);
                    return true;
                }
                Err(MediaError::InvalidState(_)) => return false,
                Err(e) => {
                    error!("Media worker restart failed: {}; retrying in {:?}", e, backoff);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(supervision.restart_backoff_max);
        }
    }

    /// Releases router then worker. Further `initialize` calls fail.
    pub fn shutdown(&self) {
        let retired = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.state = WorkerState::Stopped;
            inner.active.take()
        };

        match retired {
            Some(active) => {
                info!("Shutting down media worker {}", active.worker_id);
                active.release();
            }
            None => warn!("Media engine shut down with no running worker"),
        }
    }
}
