use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::{Event, EventBus};
use crate::merge::{merge, player_entry, NullPolicy, TombstoneSet};
use crate::wire::{strip_private, Frame, LabFrame};

#[derive(Debug, Error)]
pub enum HubError {
    #[error("room not found: {0}")]
    RoomNotFound(String),
    #[error("unknown connection: {0}")]
    UnknownConnection(String),
}

/// Summary of one live room, for the status surface.
#[derive(Clone, Debug, Serialize)]
pub struct RoomStats {
    pub room: String,
    pub connections: usize,
    pub created_at: DateTime<Utc>,
}

struct Connection {
    tx: mpsc::Sender<String>,
    #[allow(dead_code)]
    connected_at: DateTime<Utc>,
}

/// One room's authoritative view: the merged state every delta lands in,
/// the deletion tombstones, and the live connections.
struct Room {
    state: Value,
    tombstones: TombstoneSet,
    conns: HashMap<String, Connection>,
    created_at: DateTime<Utc>,
}

impl Room {
    fn new() -> Self {
        Self {
            state: Value::Object(Map::new()),
            tombstones: TombstoneSet::new(),
            conns: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Best-effort fan-out to every connection except `skip`. A full or
    /// closed channel loses the frame for that receiver only.
    fn broadcast_except(&self, skip: &str, frame: &str) {
        for (conn_id, conn) in &self.conns {
            if conn_id == skip {
                continue;
            }
            if let Err(err) = conn.tx.try_send(frame.to_string()) {
                warn!(%conn_id, %err, "dropping frame for unreachable connection");
            }
        }
    }
}

/// The relay hub: a per-room actor that assigns connection identities,
/// holds one authoritative merged state per room, and rebroadcasts payloads
/// to every other connection in the room.
///
/// Rooms are fully isolated from one another — state, tombstones, and
/// identities never cross the `{party}/{room}` boundary — and a room is
/// destroyed when its last connection closes.
#[derive(Clone)]
pub struct RoomHub {
    rooms: Arc<RwLock<HashMap<String, Room>>>,
    bus: EventBus,
}

impl RoomHub {
    pub fn new(bus: EventBus) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            bus,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Open a connection in `{party}/{room}`, creating the room on first
    /// contact. Assigns a fresh identity, seeds an empty entity for it in
    /// room state, queues the identity and current merged state for the new
    /// connection, and announces the join to everyone else.
    pub async fn connect(
        &self,
        party: &str,
        room: &str,
        buffer: usize,
    ) -> (String, mpsc::Receiver<String>) {
        let key = room_key(party, room);
        let conn_id = new_conn_id();
        let (tx, rx) = mpsc::channel(buffer);

        let mut rooms = self.rooms.write().await;
        let opened_room = !rooms.contains_key(&key);
        let entry = rooms.entry(key.clone()).or_insert_with(Room::new);

        {
            let entry = &mut *entry;
            merge(
                &mut entry.state,
                &player_entry(&conn_id, Value::Object(Map::new())),
                NullPolicy::Delete,
                &mut entry.tombstones,
            );
        }

        self.queue_frame(&tx, &conn_id, Frame::Identity(conn_id.clone())).await;
        self.queue_frame(
            &tx,
            &conn_id,
            Frame::Lab(LabFrame::Snapshot(strip_private(&entry.state))),
        )
        .await;

        entry.conns.insert(
            conn_id.clone(),
            Connection {
                tx,
                connected_at: Utc::now(),
            },
        );
        entry.broadcast_except(&conn_id, &format!("+{conn_id}"));
        drop(rooms);

        if opened_room {
            self.bus.emit(Event::RoomOpened { room: key.clone() });
        }
        self.bus.emit(Event::ConnectionOpened {
            room: key.clone(),
            conn_id: conn_id.clone(),
        });
        info!(room = %key, %conn_id, "connection opened");

        (conn_id, rx)
    }

    /// Handle one text frame from a connection.
    ///
    /// Delta payloads (lab `_d` frames or `{"delta": ...}` envelopes) are
    /// merged into the room's authoritative state and the raw payload is
    /// rebroadcast verbatim to the other connections. Every other parseable
    /// shape passes through unmodified. Malformed payloads are logged and
    /// dropped without touching state or the connection.
    pub async fn message(
        &self,
        party: &str,
        room: &str,
        conn_id: &str,
        text: &str,
    ) -> Result<(), HubError> {
        let key = room_key(party, room);
        let mut rooms = self.rooms.write().await;
        let entry = rooms
            .get_mut(&key)
            .ok_or_else(|| HubError::RoomNotFound(key.clone()))?;
        if !entry.conns.contains_key(conn_id) {
            return Err(HubError::UnknownConnection(conn_id.to_string()));
        }

        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(room = %key, %conn_id, %err, "dropping malformed message");
                return Ok(());
            }
        };

        let delta = match &frame {
            Frame::Lab(LabFrame::Delta(delta)) => Some(delta),
            Frame::Envelope(env) => env.delta.as_ref(),
            _ => None,
        };

        if let Some(delta) = delta {
            {
                let entry = &mut *entry;
                merge(
                    &mut entry.state,
                    delta,
                    NullPolicy::Delete,
                    &mut entry.tombstones,
                );
            }
            entry.broadcast_except(conn_id, text);
            drop(rooms);
            self.bus.emit(Event::DeltaRelayed {
                room: key,
                from: conn_id.to_string(),
            });
        } else {
            entry.broadcast_except(conn_id, text);
        }

        Ok(())
    }

    /// Close a connection: its entity is deleted (and tombstoned) in room
    /// state, the departure is announced, and an emptied room is destroyed.
    /// Returns `false` if the room or connection was already gone.
    pub async fn disconnect(&self, party: &str, room: &str, conn_id: &str) -> bool {
        let key = room_key(party, room);
        let mut rooms = self.rooms.write().await;
        let Some(entry) = rooms.get_mut(&key) else {
            return false;
        };
        if entry.conns.remove(conn_id).is_none() {
            return false;
        }

        {
            let entry = &mut *entry;
            merge(
                &mut entry.state,
                &player_entry(conn_id, Value::Null),
                NullPolicy::Delete,
                &mut entry.tombstones,
            );
        }
        entry.broadcast_except(conn_id, &format!("-{conn_id}"));

        let emptied = entry.conns.is_empty();
        if emptied {
            rooms.remove(&key);
        }
        drop(rooms);

        self.bus.emit(Event::ConnectionClosed {
            room: key.clone(),
            conn_id: conn_id.to_string(),
        });
        if emptied {
            self.bus.emit(Event::RoomClosed { room: key.clone() });
        }
        info!(room = %key, %conn_id, emptied, "connection closed");
        true
    }

    // -- status surface -----------------------------------------------------

    /// Deep copy of a room's merged state, if the room is live.
    pub async fn room_state(&self, party: &str, room: &str) -> Option<Value> {
        let rooms = self.rooms.read().await;
        rooms.get(&room_key(party, room)).map(|r| r.state.clone())
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn connection_count(&self, party: &str, room: &str) -> usize {
        let rooms = self.rooms.read().await;
        rooms
            .get(&room_key(party, room))
            .map_or(0, |r| r.conns.len())
    }

    pub async fn stats(&self) -> Vec<RoomStats> {
        let rooms = self.rooms.read().await;
        rooms
            .iter()
            .map(|(key, room)| RoomStats {
                room: key.clone(),
                connections: room.conns.len(),
                created_at: room.created_at,
            })
            .collect()
    }

    /// Identity and snapshot delivery for a freshly opened connection.
    async fn queue_frame(&self, tx: &mpsc::Sender<String>, conn_id: &str, frame: Frame) {
        match frame.encode() {
            Ok(text) => {
                if tx.send(text).await.is_err() {
                    warn!(%conn_id, "connection receiver dropped before welcome");
                }
            }
            Err(err) => warn!(%conn_id, %err, "welcome frame encoding failed"),
        }
    }
}

fn room_key(party: &str, room: &str) -> String {
    format!("{party}/{room}")
}

fn new_conn_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc::Receiver;

    fn make_hub() -> RoomHub {
        RoomHub::new(EventBus::default())
    }

    fn next(rx: &mut Receiver<String>) -> String {
        rx.try_recv().expect("expected a queued frame")
    }

    /// Drain the welcome sequence (`@id`, `_s...`) a fresh connection gets.
    fn drain_welcome(rx: &mut Receiver<String>, conn_id: &str) {
        assert_eq!(next(rx), format!("@{conn_id}"));
        assert!(next(rx).starts_with("_s"));
    }

    #[tokio::test]
    async fn connect_assigns_identity_and_sends_state() {
        let hub = make_hub();
        let (id, mut rx) = hub.connect("cats", "main", 16).await;

        assert_eq!(next(&mut rx), format!("@{id}"));
        let snapshot = next(&mut rx);
        let frame = Frame::parse(&snapshot).unwrap();
        match frame {
            Frame::Lab(LabFrame::Snapshot(state)) => {
                // Our own freshly seeded entity is already in room state.
                assert_eq!(state, player_entry(&id, json!({})));
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_is_announced_to_others_only() {
        let hub = make_hub();
        let (a, mut rx_a) = hub.connect("cats", "main", 16).await;
        drain_welcome(&mut rx_a, &a);

        let (b, mut rx_b) = hub.connect("cats", "main", 16).await;
        drain_welcome(&mut rx_b, &b);

        assert_eq!(next(&mut rx_a), format!("+{b}"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_joiner_sees_merged_state() {
        let hub = make_hub();
        let (a, mut rx_a) = hub.connect("cats", "main", 16).await;
        drain_welcome(&mut rx_a, &a);

        hub.message("cats", "main", &a, r#"_d{"round":7}"#)
            .await
            .unwrap();

        let (b, mut rx_b) = hub.connect("cats", "main", 16).await;
        assert_eq!(next(&mut rx_b), format!("@{b}"));
        match Frame::parse(&next(&mut rx_b)).unwrap() {
            Frame::Lab(LabFrame::Snapshot(state)) => {
                assert_eq!(state.get("round"), Some(&json!(7)));
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delta_rebroadcasts_to_everyone_but_the_sender() {
        let hub = make_hub();
        let (a, mut rx_a) = hub.connect("cats", "main", 16).await;
        drain_welcome(&mut rx_a, &a);
        let (b, mut rx_b) = hub.connect("cats", "main", 16).await;
        drain_welcome(&mut rx_b, &b);
        let (c, mut rx_c) = hub.connect("cats", "main", 16).await;
        drain_welcome(&mut rx_c, &c);

        // Drain the join notifications.
        next(&mut rx_a);
        next(&mut rx_a);
        next(&mut rx_b);

        let raw = r#"_d{"@players":{"x1":{"score":3}}}"#;
        hub.message("cats", "main", &a, raw).await.unwrap();

        assert_eq!(next(&mut rx_b), raw);
        assert_eq!(next(&mut rx_c), raw);
        assert!(rx_a.try_recv().is_err());

        let state = hub.room_state("cats", "main").await.unwrap();
        assert_eq!(
            state.get("@players").and_then(|p| p.get("x1")),
            Some(&json!({"score": 3}))
        );
    }

    #[tokio::test]
    async fn envelope_delta_is_equivalent() {
        let hub = make_hub();
        let (a, mut rx_a) = hub.connect("cats", "main", 16).await;
        drain_welcome(&mut rx_a, &a);
        let (b, mut rx_b) = hub.connect("cats", "main", 16).await;
        drain_welcome(&mut rx_b, &b);
        next(&mut rx_a);

        let raw = r#"{"delta":{"round":2}}"#;
        hub.message("cats", "main", &a, raw).await.unwrap();

        assert_eq!(next(&mut rx_b), raw);
        let state = hub.room_state("cats", "main").await.unwrap();
        assert_eq!(state.get("round"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn non_delta_frames_pass_through_unmodified() {
        let hub = make_hub();
        let (a, mut rx_a) = hub.connect("cats", "main", 16).await;
        drain_welcome(&mut rx_a, &a);
        let (b, mut rx_b) = hub.connect("cats", "main", 16).await;
        drain_welcome(&mut rx_b, &b);
        next(&mut rx_a);

        hub.message("cats", "main", &a, "_?s").await.unwrap();
        assert_eq!(next(&mut rx_b), "_?s");

        // Pass-through leaves room state untouched.
        let state = hub.room_state("cats", "main").await.unwrap();
        assert!(state.get("round").is_none());
    }

    #[tokio::test]
    async fn malformed_message_is_dropped_quietly() {
        let hub = make_hub();
        let (a, mut rx_a) = hub.connect("cats", "main", 16).await;
        drain_welcome(&mut rx_a, &a);
        let (b, mut rx_b) = hub.connect("cats", "main", 16).await;
        drain_welcome(&mut rx_b, &b);
        next(&mut rx_a);

        hub.message("cats", "main", &a, "_d{broken").await.unwrap();
        assert!(rx_b.try_recv().is_err());

        // The connection is still healthy afterwards.
        hub.message("cats", "main", &a, r#"_d{"ok":1}"#)
            .await
            .unwrap();
        assert_eq!(next(&mut rx_b), r#"_d{"ok":1}"#);
    }

    #[tokio::test]
    async fn unknown_connection_is_rejected() {
        let hub = make_hub();
        let (_a, _rx) = hub.connect("cats", "main", 16).await;

        let err = hub
            .message("cats", "main", "ghost", r#"_d{"x":1}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::UnknownConnection(_)));

        let err = hub
            .message("flight", "main", "ghost", r#"_d{"x":1}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::RoomNotFound(_)));
    }

    #[tokio::test]
    async fn disconnect_removes_entity_and_announces() {
        let hub = make_hub();
        let (a, mut rx_a) = hub.connect("cats", "main", 16).await;
        drain_welcome(&mut rx_a, &a);
        let (b, mut rx_b) = hub.connect("cats", "main", 16).await;
        drain_welcome(&mut rx_b, &b);
        next(&mut rx_a);

        assert!(hub.disconnect("cats", "main", &b).await);
        assert!(!hub.disconnect("cats", "main", &b).await);

        assert_eq!(next(&mut rx_a), format!("-{b}"));
        let state = hub.room_state("cats", "main").await.unwrap();
        assert!(state.get("@players").and_then(|p| p.get(&b)).is_none());

        // The departed identity is tombstoned: a stale delta cannot bring
        // its entity back into room state.
        let stale = format!(r#"_d{{"@players":{{"{b}":{{"score":9}}}}}}"#);
        hub.message("cats", "main", &a, &stale).await.unwrap();
        let state = hub.room_state("cats", "main").await.unwrap();
        assert!(state.get("@players").and_then(|p| p.get(&b)).is_none());
    }

    #[tokio::test]
    async fn last_disconnect_destroys_the_room() {
        let hub = make_hub();
        let (a, _rx_a) = hub.connect("cats", "main", 16).await;
        assert_eq!(hub.room_count().await, 1);

        hub.disconnect("cats", "main", &a).await;
        assert_eq!(hub.room_count().await, 0);
        assert!(hub.room_state("cats", "main").await.is_none());

        // A new room under the same name starts from scratch.
        let (b, mut rx_b) = hub.connect("cats", "main", 16).await;
        assert_eq!(next(&mut rx_b), format!("@{b}"));
        let state = hub.room_state("cats", "main").await.unwrap();
        assert_eq!(state, player_entry(&b, json!({})));
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let hub = make_hub();
        let (a, mut rx_a) = hub.connect("cats", "main", 16).await;
        drain_welcome(&mut rx_a, &a);
        let (f, mut rx_f) = hub.connect("flight", "main", 16).await;
        drain_welcome(&mut rx_f, &f);

        // No cross-room join notifications.
        assert!(rx_a.try_recv().is_err());

        hub.message("cats", "main", &a, r#"_d{"whiskers":true}"#)
            .await
            .unwrap();
        assert!(rx_f.try_recv().is_err());

        let cats = hub.room_state("cats", "main").await.unwrap();
        let flight = hub.room_state("flight", "main").await.unwrap();
        assert_eq!(cats.get("whiskers"), Some(&json!(true)));
        assert!(flight.get("whiskers").is_none());
    }

    #[tokio::test]
    async fn stats_reflect_live_rooms() {
        let hub = make_hub();
        let (_a, _rx_a) = hub.connect("cats", "main", 16).await;
        let (_b, _rx_b) = hub.connect("cats", "main", 16).await;
        let (_f, _rx_f) = hub.connect("flight", "tower", 16).await;

        assert_eq!(hub.room_count().await, 2);
        assert_eq!(hub.connection_count("cats", "main").await, 2);
        assert_eq!(hub.connection_count("flight", "tower").await, 1);
        assert_eq!(hub.connection_count("flight", "nowhere").await, 0);

        let mut stats = hub.stats().await;
        stats.sort_by(|a, b| a.room.cmp(&b.room));
        assert_eq!(stats[0].room, "cats/main");
        assert_eq!(stats[0].connections, 2);
        assert_eq!(stats[1].room, "flight/tower");
    }

    #[tokio::test]
    async fn lifecycle_events_are_emitted() {
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let hub = RoomHub::new(bus);

        let (a, _rx) = hub.connect("cats", "main", 16).await;
        assert!(matches!(events.recv().await.unwrap(), Event::RoomOpened { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            Event::ConnectionOpened { .. }
        ));

        hub.message("cats", "main", &a, r#"_d{"x":1}"#).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            Event::DeltaRelayed { .. }
        ));

        hub.disconnect("cats", "main", &a).await;
        assert!(matches!(
            events.recv().await.unwrap(),
            Event::ConnectionClosed { .. }
        ));
        assert!(matches!(events.recv().await.unwrap(), Event::RoomClosed { .. }));
    }
}
