#![forbid(unsafe_code)]

// Producer registry - one producer per (connection, media kind)

use crate::media::engine::EngineProducer;
use crate::media::transport_registry::TransportRegistry;
use crate::media::types::{Direction, MediaError, MediaKind, MediaResult, ProducerInfo};
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use tracing::{debug, info, warn};

type ProducerKey = (String, MediaKind);

struct ProducerEntry {
    transport_id: String,
    app_data: serde_json::Value,
    producer: Box<dyn EngineProducer>,
}

/// Read-only view of a registered producer
#[derive(Debug, Clone)]
pub struct ProducerSnapshot {
    pub id: String,
    pub kind: MediaKind,
    pub transport_id: String,
    pub app_data: serde_json::Value,
}

pub struct ProducerRegistry {
    producers: StdRwLock<HashMap<ProducerKey, ProducerEntry>>,
}

impl Default for ProducerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self {
            producers: StdRwLock::new(HashMap::new()),
        }
    }

    /// Starts producing `kind` on the connection's connected send transport.
    ///
    /// An existing producer of the same kind is closed before the new one is
    /// created, so at most one is ever registered.
    ///
    /// # Errors
    /// Returns `MediaError::TransportNotFound` without a connected send transport
    /// of `generation`, or `MediaError::ProducerFailed` if the engine refuses
    pub async fn produce(
        &self,
        transports: &TransportRegistry,
        connection_id: &str,
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
        app_data: serde_json::Value,
        generation: u64,
    ) -> MediaResult<ProducerInfo> {
        let (transport_id, transport) = transports.connected_send_transport(connection_id, generation)?;

        let replaced = self.close(connection_id, kind);
        if let Some(previous) = &replaced {
            info!(
                "Replacing {} producer {} of connection {}",
                kind, previous, connection_id
            );
        }

        let producer = transport
            .produce(kind, rtp_parameters, app_data.clone())
            .await
            .map_err(|e| match e {
                MediaError::ProducerFailed(_) => e,
                other => MediaError::ProducerFailed(other.to_string()),
            })?;

        if !transports.is_connected(connection_id, Direction::Send, &transport_id) {
            warn!(
                "Send transport {} of connection {} closed while producing; discarding producer {}",
                transport_id,
                connection_id,
                producer.id()
            );
            return Err(MediaError::transport_not_found(connection_id, Direction::Send));
        }

        let id = producer.id();
        let previous = {
            let mut producers = self.producers.write().unwrap_or_else(|e| e.into_inner());
            producers.insert(
                (connection_id.to_string(), kind),
                ProducerEntry {
                    transport_id: transport_id.clone(),
                    app_data,
                    producer,
                },
            )
        };
        if let Some(previous) = previous {
            warn!(
                "Concurrent {} producer {} of connection {} dropped",
                kind,
                previous.producer.id(),
                connection_id
            );
        }

        info!(
            "Created {} producer {} on transport {} for connection {}",
            kind, id, transport_id, connection_id
        );
        Ok(ProducerInfo { id, kind, replaced })
    }

    pub fn get(&self, connection_id: &str, kind: MediaKind) -> Option<ProducerSnapshot> {
        let producers = self.producers.read().unwrap_or_else(|e| e.into_inner());
        producers
            .get(&(connection_id.to_string(), kind))
            .map(|entry| ProducerSnapshot {
                id: entry.producer.id(),
                kind: entry.producer.kind(),
                transport_id: entry.transport_id.clone(),
                app_data: entry.app_data.clone(),
            })
    }

    /// Closes the connection's producer of `kind`; returns its id if one existed
    pub fn close(&self, connection_id: &str, kind: MediaKind) -> Option<String> {
        let removed = {
            let mut producers = self.producers.write().unwrap_or_else(|e| e.into_inner());
            producers.remove(&(connection_id.to_string(), kind))
        };
        removed.map(|entry| {
            let id = entry.producer.id();
            drop(entry);
            debug!("Closed {} producer {} of connection {}", kind, id, connection_id);
            id
        })
    }

    /// Closes every producer of the connection
    pub fn close_all(&self, connection_id: &str) -> usize {
        let removed: Vec<ProducerEntry> = {
            let mut producers = self.producers.write().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<ProducerKey> = producers
                .keys()
                .filter(|(conn, _)| conn == connection_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|key| producers.remove(key)).collect()
        };

        if !removed.is_empty() {
            info!("Closed {} producers of connection {}", removed.len(), connection_id);
        }
        removed.len()
    }

    /// Drops every producer. Used on worker death and shutdown.
    pub fn clear(&self) -> usize {
        let drained: Vec<ProducerEntry> = {
            let mut producers = self.producers.write().unwrap_or_else(|e| e.into_inner());
            producers.drain().map(|(_, entry)| entry).collect()
        };
        drained.len()
    }

    pub fn count_for(&self, connection_id: &str) -> usize {
        let producers = self.producers.read().unwrap_or_else(|e| e.into_inner());
        producers.keys().filter(|(conn, _)| conn == connection_id).count()
    }

    pub fn len(&self) -> usize {
        self.producers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
