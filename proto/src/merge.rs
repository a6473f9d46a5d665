use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

/// Key prefix marking an entity collection: sub-keys are entity ids
/// (connection ids, session ids) owned by dynamic peers.
pub const COLLECTION_PREFIX: char = '@';

/// Key prefix marking client-local bookkeeping that never crosses the wire.
pub const PRIVATE_PREFIX: char = '_';

/// The entity collection holding one sub-state per connected peer.
pub const PLAYERS_KEY: &str = "@players";

pub fn is_collection_key(key: &str) -> bool {
    key.starts_with(COLLECTION_PREFIX)
}

pub fn is_private_key(key: &str) -> bool {
    key.starts_with(PRIVATE_PREFIX)
}

/// How `merge` treats a `null` leaf in a delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NullPolicy {
    /// `null` removes the key from the target. Used for authoritative views
    /// (local client state, the hub's merged room state).
    Delete,
    /// `null` is written into the target as an explicit value. Used for
    /// accumulators whose contents must remain transmittable, so a deletion
    /// can still be forwarded to other peers.
    Preserve,
}

// ---------------------------------------------------------------------------
// Tombstones
// ---------------------------------------------------------------------------

/// Permanent record of deleted entity ids, keyed by collection path.
///
/// Once an id is buried for a collection, any later delta that tries to set
/// or recreate that id is dropped before merging — deletions are terminal
/// for the lifetime of the owning room or client session. The set itself is
/// never part of the synchronized state and is never transmitted.
///
/// Collection paths are slash-joined key paths ending in an `@`-key, e.g.
/// `@players` or `@games/g1/@units`, so nested collections keep independent
/// scopes.
#[derive(Clone, Debug, Default)]
pub struct TombstoneSet {
    buried: HashMap<String, HashSet<String>>,
}

impl TombstoneSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id` as deleted within `collection`. Returns `true` if the id
    /// was not already buried.
    pub fn bury(&mut self, collection: &str, id: &str) -> bool {
        self.buried
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string())
    }

    pub fn contains(&self, collection: &str, id: &str) -> bool {
        self.buried
            .get(collection)
            .is_some_and(|ids| ids.contains(id))
    }

    pub fn is_empty(&self) -> bool {
        self.buried.values().all(|ids| ids.is_empty())
    }

    /// Number of buried ids in a specific collection.
    pub fn buried_count(&self, collection: &str) -> usize {
        self.buried.get(collection).map_or(0, |ids| ids.len())
    }
}

// ---------------------------------------------------------------------------
// Merge engine
// ---------------------------------------------------------------------------

/// Apply a partial update tree onto `target`, returning the changes that
/// actually mutated it.
///
/// Walks `delta` recursively. A `null` leaf deletes (or explicitly nulls,
/// per `nulls`) the key; a nested mapping recurses; any other leaf —
/// including arrays, which are opaque to the engine — replaces the current
/// value wholesale if it differs. Entries whose values already match the
/// target are dropped from the returned diff, so merging the same delta
/// twice yields `None` the second time.
///
/// The returned changes tree, not the raw input delta, is the payload to
/// forward to other subscribers: the input may contain already-applied or
/// tombstone-suppressed values.
///
/// Inside an entity collection (`@`-prefixed key), a `null` sub-key buries
/// that id in `tombstones` — even when the key did not exist — and any
/// sub-key already buried is skipped before merging.
pub fn merge(
    target: &mut Value,
    delta: &Value,
    nulls: NullPolicy,
    tombstones: &mut TombstoneSet,
) -> Option<Value> {
    let delta_map = delta.as_object()?;
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let changes = match target.as_object_mut() {
        Some(map) => merge_map(map, delta_map, nulls, tombstones, ""),
        None => return None,
    };
    if changes.is_empty() {
        None
    } else {
        Some(Value::Object(changes))
    }
}

fn merge_map(
    target: &mut Map<String, Value>,
    delta: &Map<String, Value>,
    nulls: NullPolicy,
    tombstones: &mut TombstoneSet,
    path: &str,
) -> Map<String, Value> {
    // Sub-keys of an @-key are entity ids subject to tombstoning.
    let at_entity_level = path
        .rsplit('/')
        .next()
        .is_some_and(is_collection_key);

    let mut changes = Map::new();

    for (key, incoming) in delta {
        if at_entity_level && tombstones.contains(path, key) {
            continue;
        }

        if incoming.is_null() {
            if at_entity_level {
                tombstones.bury(path, key);
            }
            match nulls {
                NullPolicy::Delete => {
                    // Deleting an absent key is a no-op for the caller, but
                    // the tombstone above still lands.
                    if target.remove(key).is_some() {
                        changes.insert(key.clone(), Value::Null);
                    }
                }
                NullPolicy::Preserve => {
                    if target.get(key) != Some(&Value::Null) {
                        target.insert(key.clone(), Value::Null);
                        changes.insert(key.clone(), Value::Null);
                    }
                }
            }
            continue;
        }

        if let Some(incoming_map) = incoming.as_object() {
            // Recurse into mappings so collection tombstones apply at every
            // depth, materializing an empty mapping when the target has a
            // leaf (or nothing) at this key.
            let replaced_leaf = target.get(key).is_some_and(|v| !v.is_object());
            let child_path = join_path(path, key);
            let slot = target
                .entry(key.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Some(slot_map) = slot.as_object_mut() {
                let nested = merge_map(slot_map, incoming_map, nulls, tombstones, &child_path);
                if !nested.is_empty() || replaced_leaf {
                    changes.insert(key.clone(), Value::Object(nested));
                }
            }
            continue;
        }

        // Scalar or array leaf: arrays are atomic, replaced wholesale.
        if target.get(key) != Some(incoming) {
            target.insert(key.clone(), incoming.clone());
            changes.insert(key.clone(), incoming.clone());
        }
    }

    changes
}

/// Remove every buried entity id from `value` in place.
///
/// Used when installing a full snapshot received from a peer: the snapshot
/// may predate deletions this side has already observed, and those ids must
/// not come back.
pub fn suppress_buried(value: &mut Value, tombstones: &TombstoneSet) {
    fn walk(map: &mut Map<String, Value>, tombstones: &TombstoneSet, path: &str) {
        let at_entity_level = path
            .rsplit('/')
            .next()
            .is_some_and(is_collection_key);
        if at_entity_level {
            map.retain(|id, _| !tombstones.contains(path, id));
        }
        for (key, val) in map.iter_mut() {
            if let Some(child) = val.as_object_mut() {
                walk(child, tombstones, &join_path(path, key));
            }
        }
    }

    if tombstones.is_empty() {
        return;
    }
    if let Some(map) = value.as_object_mut() {
        walk(map, tombstones, "");
    }
}

/// Build a delta touching a single entity in the player collection.
pub fn player_entry(id: &str, value: Value) -> Value {
    let mut entity = Map::new();
    entity.insert(id.to_string(), value);
    let mut wrapper = Map::new();
    wrapper.insert(PLAYERS_KEY.to_string(), Value::Object(entity));
    Value::Object(wrapper)
}

pub(crate) fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}/{key}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
