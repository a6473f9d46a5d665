use std::collections::HashSet;

use serde_json::{Map, Number, Value};

use crate::merge::{is_collection_key, join_path, TombstoneSet};

/// A delta transformer in an ordered pipeline.
///
/// Each stage inspects or rewrites the delta and calls `next` to continue
/// the chain. Not calling `next` halts the pipeline — the delta is
/// suppressed and nothing downstream (including the send) runs.
pub trait Middleware: Send {
    fn apply(&mut self, base: &Value, delta: Value, next: &mut dyn FnMut(Value));
}

/// An ordered chain of [`Middleware`] stages.
///
/// Order is caller-defined and significant: rounding before change
/// detection keeps imperceptible floating-point jitter off the wire.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: impl Middleware + 'static) {
        self.stages.push(Box::new(stage));
    }

    pub fn with(mut self, stage: impl Middleware + 'static) -> Self {
        self.push(stage);
        self
    }

    /// Run `delta` through every stage in order. Returns `None` when some
    /// stage declined to continue the chain.
    pub fn run(&mut self, base: &Value, delta: Value) -> Option<Value> {
        let mut current = delta;
        for stage in &mut self.stages {
            let mut forwarded = None;
            stage.apply(base, current, &mut |d| forwarded = Some(d));
            current = forwarded?;
        }
        Some(current)
    }
}

// ---------------------------------------------------------------------------
// Precision rounding
// ---------------------------------------------------------------------------

/// Rounds float leaves to a fixed decimal precision, trading fidelity for
/// bandwidth on high-churn fields like positions and rotations.
///
/// With an empty key set every float in the delta is rounded; otherwise
/// rounding applies to the subtrees under the configured keys, at any depth.
/// Integers pass through untouched.
pub struct PrecisionRound {
    decimals: u32,
    keys: HashSet<String>,
}

impl PrecisionRound {
    pub fn new(decimals: u32, keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            decimals,
            keys: keys.into_iter().collect(),
        }
    }

    pub fn all(decimals: u32) -> Self {
        Self::new(decimals, std::iter::empty())
    }

    fn round_in_place(&self, value: &mut Value) {
        match value {
            Value::Number(n) => {
                if n.is_f64() {
                    if let Some(f) = n.as_f64() {
                        let factor = 10f64.powi(self.decimals as i32);
                        if let Some(rounded) = Number::from_f64((f * factor).round() / factor) {
                            *n = rounded;
                        }
                    }
                }
            }
            Value::Object(map) => {
                for v in map.values_mut() {
                    self.round_in_place(v);
                }
            }
            Value::Array(items) => {
                for v in items.iter_mut() {
                    self.round_in_place(v);
                }
            }
            _ => {}
        }
    }

    fn walk(&self, map: &mut Map<String, Value>) {
        for (key, val) in map.iter_mut() {
            if self.keys.is_empty() || self.keys.contains(key) {
                self.round_in_place(val);
            } else if let Some(child) = val.as_object_mut() {
                self.walk(child);
            }
        }
    }
}

impl Middleware for PrecisionRound {
    fn apply(&mut self, _base: &Value, mut delta: Value, next: &mut dyn FnMut(Value)) {
        if let Some(map) = delta.as_object_mut() {
            self.walk(map);
        }
        next(delta);
    }
}

// ---------------------------------------------------------------------------
// Change filtering
// ---------------------------------------------------------------------------

/// Drops every delta subtree that is deep-equal to the corresponding value
/// in the base state (typically the shadow remote state), collapsing
/// branches that end up empty. A delta with nothing left halts the chain.
pub struct ChangeFilter;

fn filter_against(base: &Value, delta: &Value) -> Option<Value> {
    match (base.as_object(), delta.as_object()) {
        (Some(base_map), Some(delta_map)) => {
            let mut kept = Map::new();
            for (key, incoming) in delta_map {
                match base_map.get(key) {
                    Some(existing) => {
                        if let Some(diff) = filter_against(existing, incoming) {
                            kept.insert(key.clone(), diff);
                        }
                    }
                    // Absent in base: everything here is news, nulls
                    // included — a deletion the peer has not seen yet.
                    None => {
                        kept.insert(key.clone(), incoming.clone());
                    }
                }
            }
            if kept.is_empty() {
                None
            } else {
                Some(Value::Object(kept))
            }
        }
        _ => {
            if base == delta {
                None
            } else {
                Some(delta.clone())
            }
        }
    }
}

impl Middleware for ChangeFilter {
    fn apply(&mut self, base: &Value, delta: Value, next: &mut dyn FnMut(Value)) {
        if let Some(filtered) = filter_against(base, &delta) {
            next(filtered);
        }
        // Nothing differs from base: the chain stops here.
    }
}

// ---------------------------------------------------------------------------
// Tombstone enforcement
// ---------------------------------------------------------------------------

/// Enforces delete-terminality on deltas passing through this instance.
///
/// Within any `@`-prefixed collection, the first `null` observed for a
/// sub-key buries that id; every later mutation of it is dropped from
/// subsequent deltas. The instance owns its tombstones, so one guard on the
/// outgoing path and one on the incoming path track independently.
#[derive(Default)]
pub struct TombstoneGuard {
    tombstones: TombstoneSet,
}

impl TombstoneGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tombstones(&self) -> &TombstoneSet {
        &self.tombstones
    }

    fn walk(&mut self, map: &mut Map<String, Value>, path: &str) {
        let at_entity_level = path
            .rsplit('/')
            .next()
            .is_some_and(is_collection_key);

        if at_entity_level {
            let buried: Vec<String> = map
                .keys()
                .filter(|id| self.tombstones.contains(path, id.as_str()))
                .cloned()
                .collect();
            for id in buried {
                map.remove(&id);
            }
            for (id, val) in map.iter() {
                if val.is_null() {
                    self.tombstones.bury(path, id);
                }
            }
        }

        let mut emptied = Vec::new();
        for (key, val) in map.iter_mut() {
            if let Some(child) = val.as_object_mut() {
                let was_populated = !child.is_empty();
                self.walk(child, &join_path(path, key));
                if was_populated && child.is_empty() {
                    emptied.push(key.clone());
                }
            }
        }
        for key in emptied {
            map.remove(&key);
        }
    }
}

impl Middleware for TombstoneGuard {
    fn apply(&mut self, _base: &Value, mut delta: Value, next: &mut dyn FnMut(Value)) {
        if let Some(map) = delta.as_object_mut() {
            self.walk(map, "");
        }
        next(delta);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
