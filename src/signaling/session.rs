#![forbid(unsafe_code)]

// Per-connection signaling state machine

use super::protocol::{decode, encode, ClientMessage, ErrorCode, ServerMessage};
use super::rooms::{deliver, ClientSender, RoomRegistry};
use crate::media::{Direction, MediaError, MediaServer};
use crate::metrics::ServerMetrics;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Longest accepted room id, in characters
pub const MAX_ROOM_ID_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl SignalingError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SignalingError::Media(e) => ErrorCode::from(e),
            SignalingError::InvalidRequest(_) => ErrorCode::InvalidRequest,
        }
    }
}

fn validate_room_id(room: &str) -> Result<(), SignalingError> {
    let len = room.chars().count();
    if len == 0 || len > MAX_ROOM_ID_LEN {
        return Err(SignalingError::InvalidRequest(format!(
            "Room id must be 1 to {MAX_ROOM_ID_LEN} characters"
        )));
    }
    Ok(())
}

/// One client's view of the gateway.
///
/// Messages of a session are handled one at a time in arrival order; replies
/// and broadcasts share the client's bounded outbound queue.
pub struct Session {
    connection_id: String,
    sender: ClientSender,
    media: Arc<MediaServer>,
    rooms: Arc<RoomRegistry>,
    metrics: ServerMetrics,
}

impl Session {
    pub fn new(
        connection_id: String,
        sender: ClientSender,
        media: Arc<MediaServer>,
        rooms: Arc<RoomRegistry>,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            connection_id,
            sender,
            media,
            rooms,
            metrics,
        }
    }

    /// Queues a message for this client
    pub fn send(&self, request_id: Option<u64>, message: &ServerMessage) -> bool {
        match encode(request_id, message) {
            Ok(json) => deliver(&self.sender, &self.connection_id, Arc::new(json)),
            Err(e) => {
                warn!("Failed to serialize message for {}: {}", self.connection_id, e);
                false
            }
        }
    }

    pub fn greet(&self) {
        self.send(
            None,
            &ServerMessage::Welcome {
                connection_id: self.connection_id.clone(),
            },
        );
    }

    pub fn send_error(&self, request_id: Option<u64>, code: ErrorCode, message: impl Into<String>) {
        self.metrics.inc_errors();
        self.send(request_id, &ServerMessage::error(code, message));
    }

    /// Decodes one text frame, handles it and queues the reply, if any
    pub async fn handle_text(&self, text: &str) {
        let (request_id, parsed) = decode(text);
        let message = match parsed {
            Ok(message) => message,
            Err(e) => {
                warn!("Invalid message format from {}: {}", self.connection_id, e);
                self.send_error(request_id, ErrorCode::InvalidRequest, format!("Invalid message format: {e}"));
                return;
            }
        };

        let start = Instant::now();
        let result = self.handle(message).await;
        self.metrics.observe_message_handling(start.elapsed());

        match result {
            Ok(Some(reply)) => {
                self.send(request_id, &reply);
            }
            Ok(None) => {}
            Err(e) => {
                debug!("Request from {} failed: {}", self.connection_id, e);
                self.send_error(request_id, e.code(), e.to_string());
            }
        }
    }

    /// Applies one client message; `Ok(None)` means no reply is due
    pub async fn handle(&self, message: ClientMessage) -> Result<Option<ServerMessage>, SignalingError> {
        let connection_id = self.connection_id.as_str();

        match message {
            ClientMessage::JoinRoom { room } => {
                validate_room_id(&room)?;
                let outcome = self.rooms.join(&room, connection_id, self.sender.clone());
                if outcome.newly_joined {
                    self.metrics.inc_joins();
                }
                Ok(Some(ServerMessage::RoomJoined {
                    room,
                    members: outcome.members,
                }))
            }

            ClientMessage::LeaveRoom { room } => {
                validate_room_id(&room)?;
                if self.rooms.leave(&room, connection_id) {
                    self.metrics.add_leaves(1);
                }
                Ok(Some(ServerMessage::RoomLeft { room }))
            }

            ClientMessage::Signal { room, payload } => {
                if !self.rooms.signal(&room, connection_id, payload) {
                    debug!("Ignoring signal from {} to room {} (not a member)", connection_id, room);
                }
                Ok(None)
            }

            ClientMessage::GetRtpCapabilities => {
                let rtp_capabilities = self.media.rtp_capabilities()?;
                Ok(Some(ServerMessage::RtpCapabilities { rtp_capabilities }))
            }

            ClientMessage::CreateSendTransport => self.create_transport(Direction::Send).await.map(Some),

            ClientMessage::CreateRecvTransport => self.create_transport(Direction::Recv).await.map(Some),

            ClientMessage::ConnectTransport {
                direction,
                dtls_parameters,
            } => {
                let transport_id = self
                    .media
                    .connect_transport(connection_id, direction, dtls_parameters)
                    .await?;
                Ok(Some(ServerMessage::TransportConnected {
                    transport_id,
                    direction,
                }))
            }

            ClientMessage::Produce {
                kind,
                rtp_parameters,
                metadata,
            } => {
                let producer = self
                    .media
                    .produce(connection_id, kind, rtp_parameters, metadata)
                    .await?;
                self.metrics.inc_producers_created();
                Ok(Some(ServerMessage::ProducerCreated {
                    producer_id: producer.id,
                    kind: producer.kind,
                }))
            }

            ClientMessage::CloseProducer { kind } => {
                if !self.media.close_producer(connection_id, kind).await {
                    debug!("No {} producer to close for {}", kind, connection_id);
                }
                Ok(Some(ServerMessage::ProducerClosed { kind }))
            }
        }
    }

    async fn create_transport(&self, direction: Direction) -> Result<ServerMessage, SignalingError> {
        let info = self.media.create_transport(&self.connection_id, direction).await?;
        self.metrics.inc_transports_created();
        Ok(ServerMessage::TransportCreated {
            transport_id: info.id,
            direction: info.direction,
            ice_parameters: info.parameters.ice_parameters,
            ice_candidates: info.parameters.ice_candidates,
            dtls_parameters: info.parameters.dtls_parameters,
        })
    }

    /// Releases everything the connection owns: producers, then transports,
    /// then room memberships (announcing the departure)
    pub async fn disconnect(self) {
        self.media.release_connection(&self.connection_id).await;

        let left = self.rooms.leave_all(&self.connection_id);
        self.metrics.add_leaves(left.len() as u64);

        info!(
            "Connection {} cleaned up ({} rooms left)",
            self.connection_id,
            left.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::{client_dtls, client_rtp, eventually, test_config, FakeEngine};
    use crate::media::MediaKind;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Client {
        session: Session,
        rx: mpsc::Receiver<Arc<String>>,
    }

    impl Client {
        async fn request(&mut self, message: serde_json::Value) -> serde_json::Value {
            self.session.handle_text(&message.to_string()).await;
            self.next()
        }

        fn next(&mut self) -> serde_json::Value {
            let json = self.rx.try_recv().expect("expected a queued message");
            serde_json::from_str(&json).unwrap()
        }

        fn drain(&mut self) -> Vec<serde_json::Value> {
            let mut messages = Vec::new();
            while let Ok(json) = self.rx.try_recv() {
                messages.push(serde_json::from_str(&json).unwrap());
            }
            messages
        }
    }

    struct Harness {
        engine: FakeEngine,
        media: Arc<MediaServer>,
        rooms: Arc<RoomRegistry>,
        metrics: ServerMetrics,
    }

    impl Harness {
        async fn new() -> Self {
            let engine = FakeEngine::new();
            let media = Arc::new(MediaServer::new(Arc::new(engine.clone()), test_config()));
            media.initialize().await.unwrap();
            Self {
                engine,
                media,
                rooms: Arc::new(RoomRegistry::new()),
                metrics: ServerMetrics::new(),
            }
        }

        fn client(&self, id: &str) -> Client {
            let (tx, rx) = mpsc::channel(64);
            Client {
                session: Session::new(id.to_string(), tx, self.media.clone(), self.rooms.clone(), self.metrics.clone()),
                rx,
            }
        }
    }

    async fn publish(client: &mut Client) -> serde_json::Value {
        let created = client.request(json!({ "type": "create-send-transport", "requestId": 1 })).await;
        assert_eq!(created["type"], "transport-created");
        let connected = client
            .request(json!({ "type": "connect-transport", "direction": "send", "dtlsParameters": client_dtls() }))
            .await;
        assert_eq!(connected["type"], "transport-connected");
        client
            .request(json!({ "type": "produce", "kind": "audio", "rtpParameters": client_rtp(MediaKind::Audio), "requestId": 3 }))
            .await
    }

    #[tokio::test]
    async fn test_welcome_carries_connection_id() {
        let harness = Harness::new().await;
        let mut client = harness.client("c1");
        client.session.greet();

        let welcome = client.next();
        assert_eq!(welcome["type"], "welcome");
        assert_eq!(welcome["connectionId"], "c1");
    }

    #[tokio::test]
    async fn test_second_joiner_learns_first() {
        let harness = Harness::new().await;
        let mut first = harness.client("c1");
        let mut second = harness.client("c2");

        let joined = first.request(json!({ "type": "join-room", "room": "room1", "requestId": 1 })).await;
        assert_eq!(joined["type"], "room-joined");
        assert_eq!(joined["requestId"], 1);
        assert_eq!(joined["members"], json!([]));

        second.session.handle_text(&json!({ "type": "join-room", "room": "room1" }).to_string()).await;
        let messages = second.drain();
        assert_eq!(messages[0]["type"], "user-joined");
        assert_eq!(messages[0]["connectionId"], "c1");
        assert_eq!(messages[1]["type"], "room-joined");
        assert_eq!(messages[1]["members"], json!(["c1"]));

        let to_first = first.drain();
        assert_eq!(to_first.len(), 1);
        assert_eq!(to_first[0]["type"], "user-joined");
        assert_eq!(to_first[0]["connectionId"], "c2");
    }

    #[tokio::test]
    async fn test_produce_flow() {
        let harness = Harness::new().await;
        let mut client = harness.client("c1");

        let capabilities = client.request(json!({ "type": "get-rtp-capabilities" })).await;
        assert_eq!(capabilities["type"], "rtp-capabilities");
        assert!(capabilities["rtpCapabilities"]["codecs"].is_array());

        let produced = publish(&mut client).await;
        assert_eq!(produced["type"], "producer-created");
        assert_eq!(produced["kind"], "audio");
        assert_eq!(produced["requestId"], 3);
        assert!(produced["producerId"].is_string());
        assert_eq!(harness.engine.live_producers(), 1);
    }

    #[tokio::test]
    async fn test_produce_without_transport_is_rejected() {
        let harness = Harness::new().await;
        let mut client = harness.client("c1");

        let reply = client
            .request(json!({ "type": "produce", "kind": "video", "rtpParameters": {}, "requestId": 5 }))
            .await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["code"], "transport-not-found");
        assert_eq!(reply["requestId"], 5);
        assert_eq!(harness.metrics.errors(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_transport_is_rejected() {
        let harness = Harness::new().await;
        let mut client = harness.client("c1");

        let first = client.request(json!({ "type": "create-recv-transport" })).await;
        assert_eq!(first["type"], "transport-created");
        assert_eq!(first["direction"], "recv");

        let second = client.request(json!({ "type": "create-recv-transport" })).await;
        assert_eq!(second["code"], "duplicate-resource");
        assert_eq!(harness.engine.live_transports(), 1);
    }

    #[tokio::test]
    async fn test_engine_not_ready_during_restart() {
        let harness = Harness::new().await;
        let mut client = harness.client("c1");
        harness.engine.fail_worker_starts(usize::MAX);
        assert!(harness.engine.kill_worker());
        eventually("worker death", || harness.media.supervisor().generation() == 1
            && harness.media.rtp_capabilities().is_err())
        .await;

        let reply = client.request(json!({ "type": "create-send-transport" })).await;
        assert_eq!(reply["code"], "engine-not-ready");

        harness.engine.fail_worker_starts(0);
        eventually("worker restart", || harness.media.rtp_capabilities().is_ok()).await;
        let reply = client.request(json!({ "type": "create-send-transport" })).await;
        assert_eq!(reply["type"], "transport-created");
    }

    #[tokio::test]
    async fn test_bad_frames_are_invalid_requests() {
        let harness = Harness::new().await;
        let mut client = harness.client("c1");

        let reply = client.request(json!({ "type": "teleport", "requestId": 2 })).await;
        assert_eq!(reply["code"], "invalid-request");
        assert_eq!(reply["requestId"], 2);

        client.session.handle_text("{{{").await;
        assert_eq!(client.next()["code"], "invalid-request");

        let long_room = "r".repeat(MAX_ROOM_ID_LEN + 1);
        let reply = client.request(json!({ "type": "join-room", "room": long_room })).await;
        assert_eq!(reply["code"], "invalid-request");
        let reply = client.request(json!({ "type": "join-room", "room": "" })).await;
        assert_eq!(reply["code"], "invalid-request");
        assert_eq!(harness.rooms.room_count(), 0);
    }

    #[tokio::test]
    async fn test_signal_requires_membership() {
        let harness = Harness::new().await;
        let mut a = harness.client("a");
        let mut b = harness.client("b");
        a.request(json!({ "type": "join-room", "room": "room1" })).await;
        b.session.handle_text(&json!({ "type": "join-room", "room": "room1" }).to_string()).await;
        a.drain();
        b.drain();

        a.session
            .handle_text(&json!({ "type": "signal", "room": "room1", "payload": { "candidate": "x" } }).to_string())
            .await;
        assert!(a.drain().is_empty());
        let relayed = b.drain();
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0]["sender"], "a");

        let outsider = harness.client("z");
        outsider
            .session
            .handle_text(&json!({ "type": "signal", "room": "room1", "payload": {} }).to_string())
            .await;
        assert!(a.drain().is_empty());
        assert!(b.drain().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_leaves_nothing_behind() {
        let harness = Harness::new().await;
        let mut a = harness.client("a");
        let mut b = harness.client("b");
        a.request(json!({ "type": "join-room", "room": "room1" })).await;
        a.request(json!({ "type": "join-room", "room": "room2" })).await;
        b.session.handle_text(&json!({ "type": "join-room", "room": "room1" }).to_string()).await;
        a.drain();
        publish(&mut a).await;
        a.request(json!({ "type": "create-recv-transport" })).await;
        b.drain();

        a.session.disconnect().await;

        assert_eq!(harness.media.transports().count_for("a"), 0);
        assert_eq!(harness.media.producers().count_for("a"), 0);
        assert_eq!(harness.rooms.membership_count("a"), 0);
        assert_eq!(harness.engine.live_transports(), 0);
        assert_eq!(harness.engine.live_producers(), 0);

        let to_b = b.drain();
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0]["type"], "user-left");
        assert_eq!(to_b[0]["connectionId"], "a");
    }

    #[tokio::test]
    async fn test_failed_handshake_reports_and_cleans_up() {
        let harness = Harness::new().await;
        let mut client = harness.client("c1");
        client.request(json!({ "type": "create-send-transport" })).await;
        harness.engine.fail_connects(true);

        let reply = client
            .request(json!({ "type": "connect-transport", "direction": "send", "dtlsParameters": client_dtls() }))
            .await;
        assert_eq!(reply["code"], "handshake-failed");
        assert_eq!(harness.media.transports().count_for("c1"), 0);

        let reply = client
            .request(json!({ "type": "connect-transport", "direction": "send", "dtlsParameters": client_dtls() }))
            .await;
        assert_eq!(reply["code"], "transport-not-found");
    }

    #[tokio::test]
    async fn test_close_producer() {
        let harness = Harness::new().await;
        let mut client = harness.client("c1");
        publish(&mut client).await;

        let reply = client.request(json!({ "type": "close-producer", "kind": "audio" })).await;
        assert_eq!(reply["type"], "producer-closed");
        assert_eq!(harness.engine.live_producers(), 0);

        let reply = client.request(json!({ "type": "close-producer", "kind": "audio" })).await;
        assert_eq!(reply["type"], "producer-closed");
    }
}
