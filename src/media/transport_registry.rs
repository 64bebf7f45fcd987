#![forbid(unsafe_code)]

// Transport registry - per-connection send/recv WebRTC transports

use crate::media::config::WebRtcTransportConfig;
use crate::media::engine::{EngineEventSender, EngineTransport};
use crate::media::supervisor::EngineHandle;
use crate::media::types::{
    Direction, MediaError, MediaResult, TransportInfo, TransportSnapshot, TransportState,
};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

type TransportKey = (String, Direction);

struct TransportEntry {
    id: String,
    state: TransportState,
    generation: u64,
    created_at: Instant,
    transport: Arc<dyn EngineTransport>,
}

impl TransportEntry {
    fn snapshot(&self, key: &TransportKey) -> TransportSnapshot {
        TransportSnapshot {
            id: self.id.clone(),
            connection_id: key.0.clone(),
            direction: key.1,
            state: self.state,
            generation: self.generation,
        }
    }
}

/// At most one transport per (connection, direction).
///
/// The map lock is a std RwLock and is never held across an engine call.
/// Removing an entry drops the engine handle, which closes the transport.
pub struct TransportRegistry {
    transports: StdRwLock<HashMap<TransportKey, TransportEntry>>,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            transports: StdRwLock::new(HashMap::new()),
        }
    }

    /// Creates a transport on `engine`'s router and registers it as `Created`.
    ///
    /// # Errors
    /// Returns `MediaError::DuplicateResource` if the connection already has a
    /// transport in this direction, or whatever the engine reports
    pub async fn create_transport(
        &self,
        connection_id: &str,
        direction: Direction,
        engine: &EngineHandle,
        config: &WebRtcTransportConfig,
        events: EngineEventSender,
    ) -> MediaResult<TransportInfo> {
        if self.get_transport(connection_id, direction).is_some() {
            return Err(duplicate(connection_id, direction));
        }

        debug!("Creating {} transport for connection {}", direction, connection_id);

        let transport: Arc<dyn EngineTransport> =
            Arc::from(engine.router().create_webrtc_transport(config, events).await?);

        let info = TransportInfo {
            id: transport.id(),
            direction,
            parameters: transport.parameters().clone(),
        };

        {
            let mut transports = self.transports.write().unwrap_or_else(|e| e.into_inner());
            match transports.entry((connection_id.to_string(), direction)) {
                // Lost a race with a concurrent create; ours is released on return
                Entry::Occupied(_) => return Err(duplicate(connection_id, direction)),
                Entry::Vacant(slot) => {
                    slot.insert(TransportEntry {
                        id: info.id.clone(),
                        state: TransportState::Created,
                        generation: engine.generation(),
                        created_at: Instant::now(),
                        transport,
                    });
                }
            }
        }

        info!(
            "Created {} transport {} for connection {}",
            direction, info.id, connection_id
        );
        Ok(info)
    }

    /// Completes the DTLS handshake of the connection's transport.
    /// Returns the transport id.
    ///
    /// A transport left over from an earlier engine generation is discarded and
    /// reported as not found. A failed handshake closes the transport.
    ///
    /// # Errors
    /// `TransportNotFound`, `InvalidState` if already connected or connecting,
    /// `HandshakeFailed` if the engine rejects the parameters
    pub async fn connect_transport(
        &self,
        connection_id: &str,
        direction: Direction,
        dtls_parameters: serde_json::Value,
        generation: u64,
    ) -> MediaResult<String> {
        let key = (connection_id.to_string(), direction);

        let (transport_id, transport) = {
            let mut transports = self.transports.write().unwrap_or_else(|e| e.into_inner());

            let stale = match transports.get(&key) {
                Some(entry) => entry.generation != generation,
                None => return Err(MediaError::transport_not_found(connection_id, direction)),
            };
            if stale {
                transports.remove(&key);
                warn!(
                    "Discarded stale {} transport of connection {} (engine restarted)",
                    direction, connection_id
                );
                return Err(MediaError::transport_not_found(connection_id, direction));
            }

            let Some(entry) = transports.get_mut(&key) else {
                return Err(MediaError::transport_not_found(connection_id, direction));
            };
            match entry.state {
                TransportState::Connected => {
                    return Err(MediaError::InvalidState(format!(
                        "Transport {} is already connected",
                        entry.id
                    )))
                }
                TransportState::Connecting => {
                    return Err(MediaError::InvalidState(format!(
                        "Transport {} is already connecting",
                        entry.id
                    )))
                }
                TransportState::Created | TransportState::Closed => {}
            }
            entry.state = TransportState::Connecting;
            (entry.id.clone(), Arc::clone(&entry.transport))
        };

        let result = transport.connect(dtls_parameters).await;

        let mut transports = self.transports.write().unwrap_or_else(|e| e.into_inner());
        let registered = transports
            .get(&key)
            .map_or(false, |entry| entry.id == transport_id);

        match result {
            Ok(()) => {
                let Some(entry) = transports.get_mut(&key).filter(|_| registered) else {
                    // Closed by a DTLS event or the handshake sweep meanwhile
                    return Err(MediaError::transport_not_found(connection_id, direction));
                };
                entry.state = TransportState::Connected;
                info!(
                    "Connected {} transport {} for connection {}",
                    direction, transport_id, connection_id
                );
                Ok(transport_id)
            }
            Err(e) => {
                if registered {
                    transports.remove(&key);
                }
                warn!(
                    "DTLS handshake failed on transport {} of connection {}: {}",
                    transport_id, connection_id, e
                );
                Err(match e {
                    MediaError::HandshakeFailed(_) => e,
                    other => MediaError::HandshakeFailed(other.to_string()),
                })
            }
        }
    }

    pub fn get_transport(&self, connection_id: &str, direction: Direction) -> Option<TransportSnapshot> {
        let key = (connection_id.to_string(), direction);
        let transports = self.transports.read().unwrap_or_else(|e| e.into_inner());
        transports.get(&key).map(|entry| entry.snapshot(&key))
    }

    pub fn find_by_id(&self, transport_id: &str) -> Option<TransportSnapshot> {
        let transports = self.transports.read().unwrap_or_else(|e| e.into_inner());
        transports
            .iter()
            .find(|(_, entry)| entry.id == transport_id)
            .map(|(key, entry)| entry.snapshot(key))
    }

    /// The connection's send transport, if connected and from `generation`.
    ///
    /// # Errors
    /// Returns `MediaError::TransportNotFound` otherwise
    pub fn connected_send_transport(
        &self,
        connection_id: &str,
        generation: u64,
    ) -> MediaResult<(String, Arc<dyn EngineTransport>)> {
        let key = (connection_id.to_string(), Direction::Send);
        let transports = self.transports.read().unwrap_or_else(|e| e.into_inner());
        match transports.get(&key) {
            Some(entry) if entry.state == TransportState::Connected && entry.generation == generation => {
                Ok((entry.id.clone(), Arc::clone(&entry.transport)))
            }
            _ => Err(MediaError::transport_not_found(connection_id, Direction::Send)),
        }
    }

    /// Whether `transport_id` is still the connection's connected transport
    pub fn is_connected(&self, connection_id: &str, direction: Direction, transport_id: &str) -> bool {
        let key = (connection_id.to_string(), direction);
        let transports = self.transports.read().unwrap_or_else(|e| e.into_inner());
        transports
            .get(&key)
            .map_or(false, |entry| entry.id == transport_id && entry.state == TransportState::Connected)
    }

    /// Closes the connection's transport in `direction`. Idempotent.
    pub fn close(&self, connection_id: &str, direction: Direction) -> bool {
        let removed = {
            let mut transports = self.transports.write().unwrap_or_else(|e| e.into_inner());
            transports.remove(&(connection_id.to_string(), direction))
        };

        match removed {
            Some(entry) => {
                info!(
                    "Closed {} transport {} for connection {}",
                    direction, entry.id, connection_id
                );
                true
            }
            None => false,
        }
    }

    pub fn close_by_id(&self, transport_id: &str) -> Option<TransportSnapshot> {
        let removed = {
            let mut transports = self.transports.write().unwrap_or_else(|e| e.into_inner());
            let key = transports
                .iter()
                .find(|(_, entry)| entry.id == transport_id)
                .map(|(key, _)| key.clone())?;
            transports.remove(&key).map(|entry| (key, entry))
        };

        removed.map(|(key, entry)| {
            info!("Closed {} transport {} for connection {}", key.1, entry.id, key.0);
            entry.snapshot(&key)
        })
    }

    /// Closes every transport still waiting for its handshake after `timeout`
    pub fn expire_handshakes(&self, timeout: Duration) -> Vec<TransportSnapshot> {
        let expired: Vec<(TransportKey, TransportEntry)> = {
            let mut transports = self.transports.write().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<TransportKey> = transports
                .iter()
                .filter(|(_, entry)| {
                    matches!(entry.state, TransportState::Created | TransportState::Connecting)
                        && entry.created_at.elapsed() >= timeout
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| transports.remove(&key).map(|entry| (key, entry)))
                .collect()
        };

        expired
            .into_iter()
            .map(|(key, entry)| {
                warn!(
                    "Closed {} transport {} for connection {}: no DTLS handshake within {:?}",
                    key.1, entry.id, key.0, timeout
                );
                entry.snapshot(&key)
            })
            .collect()
    }

    /// Drops every transport. Used on worker death and shutdown.
    pub fn close_all(&self) -> usize {
        let drained: Vec<TransportEntry> = {
            let mut transports = self.transports.write().unwrap_or_else(|e| e.into_inner());
            transports.drain().map(|(_, entry)| entry).collect()
        };
        drained.len()
    }

    pub fn count_for(&self, connection_id: &str) -> usize {
        let transports = self.transports.read().unwrap_or_else(|e| e.into_inner());
        transports.keys().filter(|(conn, _)| conn == connection_id).count()
    }

    pub fn len(&self) -> usize {
        self.transports.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn duplicate(connection_id: &str, direction: Direction) -> MediaError {
    MediaError::DuplicateResource(format!(
        "{direction} transport for connection {connection_id}"
    ))
}
