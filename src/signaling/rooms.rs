#![forbid(unsafe_code)]

// Room membership and broadcast fan-out

use super::protocol::{encode, ServerMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outbound queue of one client, carrying pre-serialized JSON
pub type ClientSender = mpsc::Sender<Arc<String>>;

/// Queues pre-serialized JSON without blocking; a slow client loses messages
pub(crate) fn deliver(sender: &ClientSender, connection_id: &str, json: Arc<String>) -> bool {
    match sender.try_send(json) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Channel full for connection {}, dropping message", connection_id);
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Channel closed for connection {} (disconnected)", connection_id);
            false
        }
    }
}

fn serialize(message: &ServerMessage) -> Option<Arc<String>> {
    match encode(None, message) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!("Failed to serialize broadcast message: {}", e);
            None
        }
    }
}

struct Room {
    id: String,
    members: HashMap<String, ClientSender>,
}

impl Room {
    fn broadcast_except(&self, sender_id: &str, message: &ServerMessage) {
        let Some(json) = serialize(message) else {
            return;
        };
        for (id, sender) in &self.members {
            if id != sender_id {
                deliver(sender, id, json.clone());
            }
        }
    }

    fn member_ids_except(&self, connection_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .members
            .keys()
            .filter(|id| id.as_str() != connection_id)
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

/// Result of a join request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// False when the connection was already a member
    pub newly_joined: bool,
    /// The other members, sorted
    pub members: Vec<String>,
}

/// Rooms are created on first join and dropped when the last member leaves.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: StdRwLock<HashMap<String, Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the connection to `room_id`.
    ///
    /// Existing members are told about the newcomer and the newcomer is
    /// introduced to each of them; a repeated join changes nothing.
    pub fn join(&self, room_id: &str, connection_id: &str, sender: ClientSender) -> JoinOutcome {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        let room = rooms.entry(room_id.to_string()).or_insert_with(|| {
            debug!("Created room {}", room_id);
            Room {
                id: room_id.to_string(),
                members: HashMap::new(),
            }
        });

        let members = room.member_ids_except(connection_id);
        if room.members.contains_key(connection_id) {
            return JoinOutcome {
                newly_joined: false,
                members,
            };
        }

        room.broadcast_except(
            connection_id,
            &ServerMessage::UserJoined {
                room: room_id.to_string(),
                connection_id: connection_id.to_string(),
            },
        );
        for member in &members {
            let introduction = ServerMessage::UserJoined {
                room: room_id.to_string(),
                connection_id: member.clone(),
            };
            if let Some(json) = serialize(&introduction) {
                deliver(&sender, connection_id, json);
            }
        }

        room.members.insert(connection_id.to_string(), sender);
        info!(
            "Connection {} joined room {} ({} members)",
            connection_id,
            room.id,
            room.members.len()
        );

        JoinOutcome {
            newly_joined: true,
            members,
        }
    }

    /// Removes the connection from `room_id`, telling the remaining members.
    /// Returns false if it was not a member.
    pub fn leave(&self, room_id: &str, connection_id: &str) -> bool {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        Self::leave_locked(&mut rooms, room_id, connection_id)
    }

    /// Removes the connection from every room; returns the rooms it left
    pub fn leave_all(&self, connection_id: &str) -> Vec<String> {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        let joined: Vec<String> = rooms
            .values()
            .filter(|room| room.members.contains_key(connection_id))
            .map(|room| room.id.clone())
            .collect();

        for room_id in &joined {
            Self::leave_locked(&mut rooms, room_id, connection_id);
        }
        joined
    }

    fn leave_locked(rooms: &mut HashMap<String, Room>, room_id: &str, connection_id: &str) -> bool {
        let Some(room) = rooms.get_mut(room_id) else {
            return false;
        };
        if room.members.remove(connection_id).is_none() {
            return false;
        }

        info!("Connection {} left room {}", connection_id, room_id);
        room.broadcast_except(
            connection_id,
            &ServerMessage::UserLeft {
                room: room_id.to_string(),
                connection_id: connection_id.to_string(),
            },
        );

        if room.members.is_empty() {
            rooms.remove(room_id);
            debug!("Removed empty room {}", room_id);
        }
        true
    }

    /// Relays `payload` to every other member. Returns false, delivering
    /// nothing, if the sender is not a member of the room.
    pub fn signal(&self, room_id: &str, sender_id: &str, payload: serde_json::Value) -> bool {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        let Some(room) = rooms.get(room_id).filter(|room| room.members.contains_key(sender_id)) else {
            return false;
        };

        room.broadcast_except(
            sender_id,
            &ServerMessage::Signal {
                room: room_id.to_string(),
                payload,
                sender: sender_id.to_string(),
            },
        );
        true
    }

    pub fn members(&self, room_id: &str) -> Vec<String> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .get(room_id)
            .map(|room| room.member_ids_except(""))
            .unwrap_or_default()
    }

    /// Number of rooms the connection belongs to
    pub fn membership_count(&self, connection_id: &str) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .values()
            .filter(|room| room.members.contains_key(connection_id))
            .count()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> (ClientSender, mpsc::Receiver<Arc<String>>) {
        mpsc::channel(16)
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<serde_json::Value> {
        let mut messages = Vec::new();
        while let Ok(json) = rx.try_recv() {
            messages.push(serde_json::from_str(&json).unwrap());
        }
        messages
    }

    #[test]
    fn test_join_announces_both_ways() {
        let rooms = RoomRegistry::new();
        let (a_tx, mut a_rx) = client();
        let (b_tx, mut b_rx) = client();

        let first = rooms.join("room1", "a", a_tx);
        assert!(first.newly_joined);
        assert!(first.members.is_empty());
        assert!(drain(&mut a_rx).is_empty());

        let second = rooms.join("room1", "b", b_tx);
        assert_eq!(second.members, vec!["a".to_string()]);

        let to_a = drain(&mut a_rx);
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0]["type"], "user-joined");
        assert_eq!(to_a[0]["connectionId"], "b");

        let to_b = drain(&mut b_rx);
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0]["type"], "user-joined");
        assert_eq!(to_b[0]["connectionId"], "a");
    }

    #[test]
    fn test_rejoin_is_idempotent() {
        let rooms = RoomRegistry::new();
        let (a_tx, mut a_rx) = client();
        let (b_tx, mut b_rx) = client();
        rooms.join("room1", "a", a_tx);
        rooms.join("room1", "b", b_tx.clone());
        drain(&mut a_rx);
        drain(&mut b_rx);

        let again = rooms.join("room1", "b", b_tx);
        assert!(!again.newly_joined);
        assert!(drain(&mut a_rx).is_empty());
        assert!(drain(&mut b_rx).is_empty());
        assert_eq!(rooms.members("room1"), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_signal_never_echoes_to_sender() {
        let rooms = RoomRegistry::new();
        let (a_tx, mut a_rx) = client();
        let (b_tx, mut b_rx) = client();
        let (c_tx, mut c_rx) = client();
        rooms.join("room1", "a", a_tx);
        rooms.join("room1", "b", b_tx);
        rooms.join("room1", "c", c_tx);
        drain(&mut a_rx);
        drain(&mut b_rx);
        drain(&mut c_rx);

        assert!(rooms.signal("room1", "a", json!({ "sdp": "offer" })));

        assert!(drain(&mut a_rx).is_empty());
        for rx in [&mut b_rx, &mut c_rx] {
            let messages = drain(rx);
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0]["type"], "signal");
            assert_eq!(messages[0]["sender"], "a");
            assert_eq!(messages[0]["payload"]["sdp"], "offer");
        }
    }

    #[test]
    fn test_signal_from_non_member_is_dropped() {
        let rooms = RoomRegistry::new();
        let (a_tx, mut a_rx) = client();
        rooms.join("room1", "a", a_tx);

        assert!(!rooms.signal("room1", "stranger", json!({})));
        assert!(!rooms.signal("nowhere", "a", json!({})));
        assert!(drain(&mut a_rx).is_empty());
    }

    #[test]
    fn test_leave_all_broadcasts_and_collects_empty_rooms() {
        let rooms = RoomRegistry::new();
        let (a_tx, mut a_rx) = client();
        let (b_tx, _b_rx) = client();
        rooms.join("room1", "a", a_tx.clone());
        rooms.join("room2", "a", a_tx);
        rooms.join("room1", "b", b_tx.clone());
        rooms.join("room3", "b", b_tx);
        drain(&mut a_rx);

        let mut left = rooms.leave_all("b");
        left.sort();
        assert_eq!(left, vec!["room1".to_string(), "room3".to_string()]);

        let to_a = drain(&mut a_rx);
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0]["type"], "user-left");
        assert_eq!(to_a[0]["connectionId"], "b");

        assert_eq!(rooms.membership_count("b"), 0);
        assert_eq!(rooms.room_count(), 2);
        assert!(!rooms.leave("room1", "b"));
    }
}
