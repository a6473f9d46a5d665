use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::events::{Event, EventBus};
use crate::merge::{merge, player_entry, suppress_buried, NullPolicy, TombstoneSet, PLAYERS_KEY};
use crate::middleware::{ChangeFilter, Pipeline, PrecisionRound, TombstoneGuard};
use crate::wire::{strip_private, Frame, LabFrame};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no identity assigned yet")]
    NoIdentity,
}

/// Application hook deciding whether a filtered delta is significant enough
/// to send: `(delta, shadow_remote_state, self_id) -> bool`.
pub type DeltaEvaluator = Arc<dyn Fn(&Value, &Value, Option<&str>) -> bool + Send + Sync>;

/// Application hook rewriting a payload in place, invoked on both outgoing
/// and incoming payloads (game-specific normalization beyond the built-in
/// middlewares).
pub type DeltaNormalizer = Arc<dyn Fn(&mut Value) + Send + Sync>;

/// Tuning for a [`StateClient`].
#[derive(Clone)]
pub struct ClientConfig {
    /// Trailing window of the send throttle. The leading edge always
    /// flushes immediately; changes within the window batch into one send.
    pub throttle: Duration,
    /// Decimal places for outgoing float rounding. `None` disables it.
    pub round_decimals: Option<u32>,
    /// Keys whose subtrees get rounded; empty means every float.
    pub round_keys: Vec<String>,
    /// Send a full snapshot to a joining peer when we already hold state.
    pub snapshot_on_join: bool,
    pub evaluator: Option<DeltaEvaluator>,
    pub normalizer: Option<DeltaNormalizer>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(50),
            round_decimals: None,
            round_keys: Vec::new(),
            snapshot_on_join: true,
            evaluator: None,
            normalizer: None,
        }
    }
}

struct ClientInner {
    conn_id: Option<String>,
    /// Authoritative local view for this peer.
    local: Value,
    /// Last state believed to be known by the room, private keys excluded.
    /// Touched only by the send-flush and snapshot-apply paths.
    shadow: Value,
    /// Coalesced not-yet-sent local mutations. Nulls preserved so deletions
    /// stay transmittable.
    pending: Value,
    tombstones: TombstoneSet,
    outgoing: Pipeline,
    snapshot_norm: Pipeline,
    window_armed: bool,
    flush_task: Option<JoinHandle<()>>,
    open: bool,
}

/// Client-side state manager: owns local state, the shadow remote copy, and
/// the coalescing send scheduler.
///
/// The transport is injected at construction as an outbound frame channel;
/// incoming frames and lifecycle transitions are fed in through
/// [`handle_frame`](StateClient::handle_frame), `handle_open`,
/// `handle_close`, and `handle_error`. State notifications go out on a
/// typed event bus, never through the transport object.
#[derive(Clone)]
pub struct StateClient {
    inner: Arc<Mutex<ClientInner>>,
    bus: EventBus,
    outbound: mpsc::Sender<String>,
    throttle: Duration,
    snapshot_on_join: bool,
    evaluator: Option<DeltaEvaluator>,
    normalizer: Option<DeltaNormalizer>,
}

impl StateClient {
    pub fn new(outbound: mpsc::Sender<String>, config: ClientConfig) -> Self {
        let mut outgoing = Pipeline::new();
        let mut snapshot_norm = Pipeline::new();
        if let Some(decimals) = config.round_decimals {
            outgoing.push(PrecisionRound::new(decimals, config.round_keys.iter().cloned()));
            snapshot_norm.push(PrecisionRound::new(decimals, config.round_keys.iter().cloned()));
        }
        outgoing.push(TombstoneGuard::new());
        outgoing.push(ChangeFilter);

        Self {
            inner: Arc::new(Mutex::new(ClientInner {
                conn_id: None,
                local: empty_object(),
                shadow: empty_object(),
                pending: empty_object(),
                tombstones: TombstoneSet::new(),
                outgoing,
                snapshot_norm,
                window_armed: false,
                flush_task: None,
                open: false,
            })),
            bus: EventBus::default(),
            outbound,
            throttle: config.throttle,
            snapshot_on_join: config.snapshot_on_join,
            evaluator: config.evaluator,
            normalizer: config.normalizer,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    // -- reads --------------------------------------------------------------

    pub async fn conn_id(&self) -> Option<String> {
        self.inner.lock().await.conn_id.clone()
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.open
    }

    /// Deep copy of the local state tree.
    pub async fn get_state(&self) -> Value {
        self.inner.lock().await.local.clone()
    }

    /// Zero-copy read access to the local state tree.
    pub async fn with_state<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        let inner = self.inner.lock().await;
        f(&inner.local)
    }

    pub async fn get_player_state(&self, id: &str) -> Option<Value> {
        let inner = self.inner.lock().await;
        inner.local.get(PLAYERS_KEY)?.get(id).cloned()
    }

    pub async fn get_my_state(&self) -> Option<Value> {
        let inner = self.inner.lock().await;
        let id = inner.conn_id.as_deref()?;
        inner.local.get(PLAYERS_KEY)?.get(id).cloned()
    }

    // -- writes -------------------------------------------------------------

    /// Merge a delta into local state immediately and enqueue it for the
    /// next throttled send.
    pub async fn update_state(&self, delta: Value) {
        let mut inner = self.inner.lock().await;
        self.apply_local(&mut inner, &delta);
        self.schedule_flush(&mut inner);
    }

    /// [`update_state`](StateClient::update_state) scoped to this peer's own
    /// entity. Discarded with a warning until an identity is assigned.
    pub async fn update_my_state(&self, delta: Value) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().await;
        let Some(id) = inner.conn_id.clone() else {
            warn!("update_my_state before identity assignment; mutation dropped");
            return Err(ClientError::NoIdentity);
        };
        let wrapped = player_entry(&id, delta);
        self.apply_local(&mut inner, &wrapped);
        self.schedule_flush(&mut inner);
        Ok(())
    }

    /// [`update_state`](StateClient::update_state) scoped to an arbitrary
    /// entity in the player collection.
    pub async fn update_player_state(&self, id: &str, delta: Value) {
        let mut inner = self.inner.lock().await;
        let wrapped = player_entry(id, delta);
        self.apply_local(&mut inner, &wrapped);
        self.schedule_flush(&mut inner);
    }

    /// Force a flush of the pending delta outside the throttle schedule.
    pub async fn flush_now(&self) {
        let mut inner = self.inner.lock().await;
        self.flush_locked(&mut inner);
    }

    // -- transport lifecycle ------------------------------------------------

    pub async fn handle_open(&self) {
        self.inner.lock().await.open = true;
        self.bus.emit(Event::SocketOpened);
    }

    pub async fn handle_close(&self) {
        let mut inner = self.inner.lock().await;
        inner.open = false;
        inner.window_armed = false;
        if let Some(task) = inner.flush_task.take() {
            task.abort();
        }
        drop(inner);
        self.bus.emit(Event::SocketClosed);
    }

    pub async fn handle_error(&self, detail: &str) {
        self.bus.emit(Event::TransportError {
            detail: detail.to_string(),
        });
    }

    /// Feed one incoming text frame from the transport. Malformed frames
    /// are logged and dropped without touching state.
    pub async fn handle_frame(&self, text: &str) {
        match Frame::parse(text) {
            Ok(frame) => self.dispatch(frame).await,
            Err(err) => warn!(%err, "dropping malformed frame"),
        }
    }

    /// Tear down the manager: cancels the pending throttle timer.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.window_armed = false;
        if let Some(task) = inner.flush_task.take() {
            task.abort();
        }
    }

    // -- frame dispatch -----------------------------------------------------

    async fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Identity(id) => self.on_identity(id).await,
            Frame::Joined(id) => self.on_peer_joined(id).await,
            Frame::Left(id) => self.on_peer_left(id).await,
            Frame::Lab(LabFrame::Delta(delta)) => self.on_delta(delta).await,
            Frame::Lab(LabFrame::Snapshot(snapshot)) => self.on_snapshot(snapshot).await,
            Frame::Lab(LabFrame::Ident(id)) => {
                self.bus.emit(Event::PeerAnnounced { conn_id: id });
            }
            Frame::Lab(LabFrame::Query(query)) => self.on_query(&query).await,
            Frame::Lab(LabFrame::Reply(reply)) => self.on_reply(&reply).await,
            Frame::Envelope(env) => {
                // The JSON framing carries the same semantics field by field.
                if let Some(id) = env.id {
                    self.on_identity(id).await;
                }
                if let Some(id) = env.connect {
                    self.on_peer_joined(id).await;
                }
                if let Some(id) = env.disconnect {
                    self.on_peer_left(id).await;
                }
                if let Some(state) = env.state {
                    self.on_snapshot(state).await;
                }
                if let Some(delta) = env.delta {
                    self.on_delta(delta).await;
                }
            }
        }
    }

    async fn on_identity(&self, id: String) {
        {
            let mut inner = self.inner.lock().await;
            inner.conn_id = Some(id.clone());
        }
        // Announce presence on the lab sub-protocol.
        self.send_frame(Frame::Lab(LabFrame::Ident(id.clone())));
        self.bus.emit(Event::IdentityAssigned { conn_id: id });
    }

    async fn on_peer_joined(&self, id: String) {
        if self.snapshot_on_join {
            let mut inner = self.inner.lock().await;
            self.send_snapshot_locked(&mut inner);
        }
        self.bus.emit(Event::PeerJoined { conn_id: id });
    }

    async fn on_peer_left(&self, id: String) {
        // The departure propagates exactly like a local mutation, deletion
        // and tombstone included.
        {
            let mut inner = self.inner.lock().await;
            let wrapped = player_entry(&id, Value::Null);
            self.apply_local(&mut inner, &wrapped);
            self.schedule_flush(&mut inner);
        }
        self.bus.emit(Event::PeerLeft { conn_id: id });
    }

    async fn on_delta(&self, mut delta: Value) {
        if let Some(normalize) = &self.normalizer {
            normalize(&mut delta);
        }
        let changes = {
            let mut inner = self.inner.lock().await;
            let inner = &mut *inner;
            merge(
                &mut inner.local,
                &delta,
                NullPolicy::Delete,
                &mut inner.tombstones,
            )
        };
        if let Some(changes) = changes {
            self.bus.emit(Event::DeltaApplied { changes });
        }
    }

    async fn on_snapshot(&self, mut snapshot: Value) {
        if !snapshot.is_object() {
            warn!("dropping non-object snapshot");
            return;
        }
        if let Some(normalize) = &self.normalizer {
            normalize(&mut snapshot);
        }
        {
            let mut inner = self.inner.lock().await;
            let inner = &mut *inner;

            // Ids this side has already seen die must not come back.
            suppress_buried(&mut snapshot, &inner.tombstones);

            // Defensive copy of our own entity before accepting: the
            // snapshot may be stale relative to our latest self-edits.
            let own = inner.conn_id.clone().and_then(|id| {
                inner
                    .local
                    .get(PLAYERS_KEY)
                    .and_then(|players| players.get(&id))
                    .cloned()
                    .map(|state| (id, state))
            });

            inner.local = snapshot;
            if let Some((id, state)) = own {
                let wrapped = player_entry(&id, state);
                merge(
                    &mut inner.local,
                    &wrapped,
                    NullPolicy::Delete,
                    &mut inner.tombstones,
                );
            }
            inner.shadow = strip_private(&inner.local);
        }
        self.bus.emit(Event::SnapshotApplied);
    }

    async fn on_query(&self, query: &str) {
        if query.starts_with('s') {
            let mut inner = self.inner.lock().await;
            if inner.conn_id.is_none() {
                return;
            }
            let inner = &mut *inner;
            let stripped = strip_private(&inner.local);
            if let Some(snapshot) = inner.snapshot_norm.run(&Value::Null, stripped) {
                match serde_json::to_string(&snapshot) {
                    Ok(json) => self.send_frame(Frame::Lab(LabFrame::Reply(format!("s{json}")))),
                    Err(err) => warn!(%err, "snapshot reply serialization failed"),
                }
            }
        }
    }

    async fn on_reply(&self, reply: &str) {
        if let Some(json) = reply.strip_prefix('s') {
            match serde_json::from_str(json) {
                Ok(snapshot) => self.on_snapshot(snapshot).await,
                Err(err) => warn!(%err, "dropping malformed snapshot reply"),
            }
        }
    }

    // -- merge + send machinery ---------------------------------------------

    /// Optimistic local merge plus uberdelta accumulation. Local state
    /// deletes on null; the pending buffer preserves nulls so deletions can
    /// still be transmitted.
    fn apply_local(&self, inner: &mut ClientInner, delta: &Value) {
        let inner = &mut *inner;
        merge(
            &mut inner.local,
            delta,
            NullPolicy::Delete,
            &mut inner.tombstones,
        );
        merge(
            &mut inner.pending,
            delta,
            NullPolicy::Preserve,
            &mut inner.tombstones,
        );
    }

    /// Throttle, not debounce: flush immediately when no window is armed,
    /// then open the trailing window; changes landing inside the window
    /// batch into the timer-driven flush.
    fn schedule_flush(&self, inner: &mut ClientInner) {
        if inner.window_armed {
            return;
        }
        self.flush_locked(inner);
        self.arm_window(inner);
    }

    fn arm_window(&self, inner: &mut ClientInner) {
        inner.window_armed = true;
        let client = self.clone();
        let window = self.throttle;
        inner.flush_task = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            client.on_window_elapsed().await;
        }));
    }

    async fn on_window_elapsed(&self) {
        let mut inner = self.inner.lock().await;
        if inner.pending.as_object().is_some_and(|p| !p.is_empty()) {
            self.flush_locked(&mut inner);
            self.arm_window(&mut inner);
        } else {
            // Window closed with nothing pending: no send, throttle disarms.
            inner.window_armed = false;
            inner.flush_task = None;
        }
    }

    fn flush_locked(&self, inner: &mut ClientInner) {
        let inner = &mut *inner;
        let pending = std::mem::replace(&mut inner.pending, empty_object());
        if pending.as_object().map_or(true, |p| p.is_empty()) {
            return;
        }

        let mut payload = pending;
        if let Some(normalize) = &self.normalizer {
            normalize(&mut payload);
        }

        let Some(filtered) = inner.outgoing.run(&inner.shadow, payload) else {
            return;
        };
        let outgoing = strip_private(&filtered);
        if outgoing.as_object().map_or(true, |p| p.is_empty()) {
            return;
        }

        if let Some(evaluate) = &self.evaluator {
            if !evaluate(&outgoing, &inner.shadow, inner.conn_id.as_deref()) {
                // Rejected: the pending buffer stays cleared, nothing sent.
                return;
            }
        }

        self.send_frame(Frame::Lab(LabFrame::Delta(outgoing)));
        inner.shadow = strip_private(&inner.local);
    }

    fn send_snapshot_locked(&self, inner: &mut ClientInner) {
        let inner = &mut *inner;
        let stripped = strip_private(&inner.local);
        if stripped.as_object().map_or(true, |p| p.is_empty()) {
            return;
        }
        if let Some(snapshot) = inner.snapshot_norm.run(&Value::Null, stripped) {
            self.send_frame(Frame::Lab(LabFrame::Snapshot(snapshot)));
        }
    }

    /// Fire-and-forget: a full or closed outbound channel drops the frame,
    /// which the best-effort protocol tolerates.
    fn send_frame(&self, frame: Frame) {
        match frame.encode() {
            Ok(text) => {
                if let Err(err) = self.outbound.try_send(text) {
                    warn!(%err, "outbound channel unavailable; frame dropped");
                }
            }
            Err(err) => warn!(%err, "frame encoding failed; frame dropped"),
        }
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
