use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Lifecycle and state events emitted by the client manager and the room hub.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    // Client-side lifecycle.
    SocketOpened,
    SocketClosed,
    TransportError {
        detail: String,
    },
    IdentityAssigned {
        conn_id: String,
    },
    PeerJoined {
        conn_id: String,
    },
    PeerLeft {
        conn_id: String,
    },
    PeerAnnounced {
        conn_id: String,
    },
    SnapshotApplied,
    DeltaApplied {
        changes: Value,
    },
    // Hub-side lifecycle.
    RoomOpened {
        room: String,
    },
    RoomClosed {
        room: String,
    },
    ConnectionOpened {
        room: String,
        conn_id: String,
    },
    ConnectionClosed {
        room: String,
        conn_id: String,
    },
    DeltaRelayed {
        room: String,
        from: String,
    },
}

const DEFAULT_CAPACITY: usize = 256;

/// Broadcast-based event bus decoupling state machinery from its observers.
///
/// Subscribers that fall behind lose the oldest events, matching the
/// protocol's best-effort contract; emitting with no subscribers is fine.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Broadcast an event to all subscribers. Returns the receiver count.
    pub fn emit(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
