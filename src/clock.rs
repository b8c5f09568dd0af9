/// Vector clocks for causal ordering between replicas.
///
/// A vector clock maps each known NodeId to a monotonic counter. Each node
/// increments its own entry on every locally authored write and merges
/// (pointwise max) every clock it observes on inbound messages. Comparing
/// two clocks yields the happens-before relation; concurrent clocks are
/// resolved by a deterministic tiebreak that every node applies identically,
/// so conflict resolution agrees cluster-wide without coordination.
///
/// Wall-clock time never participates in ordering; timestamps on the wire
/// exist for observability only.
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Relation between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockRelation {
    /// Every entry ≤ the other's, at least one strictly less.
    Before,
    /// Every entry ≥ the other's, at least one strictly greater.
    After,
    /// Some entries less, some greater: causally unrelated.
    Concurrent,
    /// All entries equal.
    Identical,
}

impl ClockRelation {
    /// True if this side causally dominates the other.
    pub fn dominates(self) -> bool {
        matches!(self, ClockRelation::After)
    }

    /// True if this side is causally dominated by the other.
    pub fn is_dominated(self) -> bool {
        matches!(self, ClockRelation::Before)
    }

    /// True if neither side dominates.
    pub fn is_concurrent(self) -> bool {
        matches!(self, ClockRelation::Concurrent)
    }
}

/// Vector clock: NodeId → non-negative counter. Absent key = 0.
///
/// Serializes on the wire as a plain JSON object (`{"n1": 3, "n2": 1}`).
/// Deserialization is sanitizing: negative, non-numeric, or fractional
/// counters are coerced to 0 and non-object inputs yield an empty clock, so
/// a malformed peer clock degrades to "concurrent" instead of poisoning the
/// local clock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct VectorClock {
    /// Per-node counters.
    pub counters: HashMap<String, u64>,
}

impl VectorClock {
    /// Create a new empty vector clock.
    pub fn new() -> Self {
        Self {
            counters: HashMap::new(),
        }
    }

    /// Create a clock holding a single entry.
    pub fn singleton(node_id: impl Into<String>, counter: u64) -> Self {
        let mut counters = HashMap::new();
        counters.insert(node_id.into(), counter);
        Self { counters }
    }

    /// Build a clock from arbitrary JSON, sanitizing on the way in.
    ///
    /// `null` and non-object inputs yield an empty clock. Within an object,
    /// non-numeric, negative, or fractional values are coerced to 0.
    pub fn from_json(value: &JsonValue) -> Self {
        let mut counters = HashMap::new();
        if let JsonValue::Object(map) = value {
            for (node_id, raw) in map {
                let counter = match raw {
                    JsonValue::Number(n) => n.as_u64().unwrap_or(0),
                    _ => 0,
                };
                counters.insert(node_id.clone(), counter);
            }
        }
        Self { counters }
    }

    /// Get the counter for a node (0 if absent).
    pub fn get(&self, node_id: &str) -> u64 {
        self.counters.get(node_id).copied().unwrap_or(0)
    }

    /// Increment the counter for a node.
    pub fn increment(&mut self, node_id: &str) {
        let entry = self.counters.entry(node_id.to_string()).or_insert(0);
        *entry += 1;
    }

    /// Merge another clock into this one (pointwise max over the key union).
    pub fn merge(&mut self, other: &VectorClock) {
        for (node_id, counter) in &other.counters {
            let entry = self.counters.entry(node_id.clone()).or_insert(0);
            *entry = (*entry).max(*counter);
        }
    }

    /// Ensure a node has a key in this clock (value ≥ 0).
    ///
    /// Every NodeId seen in any inbound message must be represented so that
    /// later comparisons observe the full set of writers.
    pub fn ensure_known(&mut self, node_id: &str) {
        self.counters.entry(node_id.to_string()).or_insert(0);
    }

    /// Number of tracked nodes.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// True if no node is tracked yet.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Compare two clocks over the union of their keys.
    ///
    /// Short-circuits to `Concurrent` as soon as both a strictly-less and a
    /// strictly-greater entry have been observed.
    pub fn compare(&self, other: &VectorClock) -> ClockRelation {
        let mut has_less = false;
        let mut has_greater = false;

        for node_id in self.counters.keys().chain(other.counters.keys()) {
            match self.get(node_id).cmp(&other.get(node_id)) {
                std::cmp::Ordering::Less => has_less = true,
                std::cmp::Ordering::Greater => has_greater = true,
                std::cmp::Ordering::Equal => {}
            }
            if has_less && has_greater {
                return ClockRelation::Concurrent;
            }
        }

        match (has_less, has_greater) {
            (true, true) => ClockRelation::Concurrent,
            (true, false) => ClockRelation::Before,
            (false, true) => ClockRelation::After,
            (false, false) => ClockRelation::Identical,
        }
    }

    /// True if this clock dominates (happened after) the other.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        self.compare(other).dominates()
    }

    /// True if this clock is dominated by (happened before) the other.
    pub fn is_dominated_by(&self, other: &VectorClock) -> bool {
        self.compare(other).is_dominated()
    }

    /// True if the clocks are concurrent.
    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other).is_concurrent()
    }

    /// Decide whether the local side wins against the other side.
    ///
    /// Non-concurrent clocks follow causal order (identical counts as a
    /// local win so replaying a write is a no-op). Concurrent clocks fall
    /// back to lexicographic order on the node ids: the smaller id wins.
    /// The rule is symmetric, so both peers of a conflict reach the same
    /// verdict from their own perspective.
    pub fn wins_over(&self, other: &VectorClock, self_id: &str, other_id: &str) -> bool {
        match self.compare(other) {
            ClockRelation::After | ClockRelation::Identical => true,
            ClockRelation::Before => false,
            ClockRelation::Concurrent => self_id < other_id,
        }
    }
}

impl<'de> Deserialize<'de> for VectorClock {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = JsonValue::deserialize(deserializer)?;
        Ok(VectorClock::from_json(&value))
    }
}
