/// Conflict resolution between a locally stored record and an incoming one.
///
/// Given a path and two records, the resolver chooses a single winner (or
/// computes a merge). Strategies are selected per path prefix, with the
/// longest matching prefix winning. Deletion handling runs before strategy
/// selection so tombstones and concurrent updates resolve consistently on
/// every node.
///
/// Whatever strategy runs, the outcome depends only on the two records and
/// the path. Both peers of a conflict therefore reach the same verdict from
/// their own side, which is what lets the cluster converge without
/// coordination.
use crate::clock::ClockRelation;
use crate::error::MeshResult;
use crate::types::{path_segments, Record};
use dashmap::DashMap;
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use tracing::warn;

/// The closed set of built-in strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictStrategy {
    /// Causal order decides; concurrent writes tie-break on origin.
    #[default]
    VectorDominance,
    /// The causally earlier write survives; concurrent tiebreak reversed.
    FirstWriteWins,
    /// Field-wise merge of two object values; falls back to
    /// vector-dominance for non-object values.
    MergeFields,
    /// A registered resolver function decides; falls back to
    /// vector-dominance on failure.
    Custom,
}

impl ConflictStrategy {
    /// Parse a strategy name. `last-write-wins` is accepted as an alias of
    /// `vector-dominance`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "vector-dominance" | "last-write-wins" => Some(ConflictStrategy::VectorDominance),
            "first-write-wins" => Some(ConflictStrategy::FirstWriteWins),
            "merge-fields" => Some(ConflictStrategy::MergeFields),
            "custom" => Some(ConflictStrategy::Custom),
            _ => None,
        }
    }

    /// The canonical name of this strategy.
    pub fn name(&self) -> &'static str {
        match self {
            ConflictStrategy::VectorDominance => "vector-dominance",
            ConflictStrategy::FirstWriteWins => "first-write-wins",
            ConflictStrategy::MergeFields => "merge-fields",
            ConflictStrategy::Custom => "custom",
        }
    }
}

/// A user-supplied conflict resolver.
///
/// Implemented for any matching closure, so callers can register plain
/// functions. A failing resolver is logged and the conflict falls back to
/// vector-dominance; it never aborts the write pipeline.
pub trait ResolveConflict: Send + Sync {
    /// Choose the surviving record for `path`.
    fn resolve(&self, path: &str, local: &Record, remote: &Record) -> MeshResult<Record>;
}

impl<F> ResolveConflict for F
where
    F: Fn(&str, &Record, &Record) -> MeshResult<Record> + Send + Sync,
{
    fn resolve(&self, path: &str, local: &Record, remote: &Record) -> MeshResult<Record> {
        self(path, local, remote)
    }
}

/// Path-scoped strategy selection and resolution.
pub struct ConflictResolver {
    default_strategy: ConflictStrategy,
    path_strategies: DashMap<String, ConflictStrategy>,
    custom_resolvers: DashMap<String, Arc<dyn ResolveConflict>>,
}

impl ConflictResolver {
    /// Create a resolver with the given default strategy and path rules.
    pub fn new(
        default_strategy: ConflictStrategy,
        path_strategies: impl IntoIterator<Item = (String, ConflictStrategy)>,
    ) -> Self {
        let strategies = DashMap::new();
        for (prefix, strategy) in path_strategies {
            strategies.insert(prefix, strategy);
        }
        Self {
            default_strategy,
            path_strategies: strategies,
            custom_resolvers: DashMap::new(),
        }
    }

    /// Set the strategy for a path prefix.
    pub fn set_strategy(&self, prefix: impl Into<String>, strategy: ConflictStrategy) {
        self.path_strategies.insert(prefix.into(), strategy);
    }

    /// Register a custom resolver for a path prefix. The prefix's strategy
    /// is switched to `Custom` so the resolver actually runs.
    pub fn register_resolver(&self, prefix: impl Into<String>, resolver: Arc<dyn ResolveConflict>) {
        let prefix = prefix.into();
        self.path_strategies
            .insert(prefix.clone(), ConflictStrategy::Custom);
        self.custom_resolvers.insert(prefix, resolver);
    }

    /// Resolve a conflict between the stored record and an incoming one.
    ///
    /// Never fails: strategy errors degrade to vector-dominance.
    pub fn resolve(&self, path: &str, local: &Record, remote: &Record) -> Record {
        // Deletion handling runs before strategy selection and consults
        // vector clocks, never wall clocks.
        if let Some(winner) = self.resolve_deletion(path, local, remote) {
            return winner;
        }

        match self.strategy_for(path) {
            ConflictStrategy::VectorDominance => vector_dominance(local, remote),
            ConflictStrategy::FirstWriteWins => first_write_wins(local, remote),
            ConflictStrategy::MergeFields => merge_fields(local, remote),
            ConflictStrategy::Custom => self.run_custom(path, local, remote),
        }
    }

    /// Select the strategy for a path: longest matching prefix wins.
    ///
    /// Two match forms are accepted: segment prefixes of decreasing length,
    /// and the legacy string form `starts_with(prefix + "/") || == prefix`.
    /// The segment form takes precedence when both match.
    pub fn strategy_for(&self, path: &str) -> ConflictStrategy {
        let segments = path_segments(path);
        for end in (1..=segments.len()).rev() {
            let prefix = segments[..end].join("/");
            if let Some(strategy) = self.path_strategies.get(&prefix) {
                return *strategy;
            }
        }

        // Legacy form: raw string prefixes that may not fall on the same
        // segment boundaries as the canonicalized path.
        let mut best: Option<(usize, ConflictStrategy)> = None;
        for entry in self.path_strategies.iter() {
            let prefix = entry.key();
            if path == prefix || path.starts_with(&format!("{}/", prefix)) {
                let len = prefix.len();
                if best.map_or(true, |(best_len, _)| len > best_len) {
                    best = Some((len, *entry.value()));
                }
            }
        }
        best.map(|(_, s)| s).unwrap_or(self.default_strategy)
    }

    fn run_custom(&self, path: &str, local: &Record, remote: &Record) -> Record {
        let resolver = self.resolver_for(path);
        match resolver {
            Some(resolver) => match resolver.resolve(path, local, remote) {
                Ok(winner) => winner,
                Err(e) => {
                    warn!(path, error = %e, "custom resolver failed, falling back");
                    vector_dominance(local, remote)
                }
            },
            None => {
                warn!(path, "custom strategy with no registered resolver");
                vector_dominance(local, remote)
            }
        }
    }

    fn resolver_for(&self, path: &str) -> Option<Arc<dyn ResolveConflict>> {
        let segments = path_segments(path);
        for end in (1..=segments.len()).rev() {
            let prefix = segments[..end].join("/");
            if let Some(resolver) = self.custom_resolvers.get(&prefix) {
                return Some(resolver.clone());
            }
        }
        None
    }

    /// Resolve conflicts where at least one side is a tombstone.
    ///
    /// Returns `None` when neither side is deleted, handing control to the
    /// configured strategy.
    fn resolve_deletion(&self, _path: &str, local: &Record, remote: &Record) -> Option<Record> {
        match (local.is_tombstone(), remote.is_tombstone()) {
            (false, false) => None,
            (true, true) => Some(vector_dominance(local, remote)),
            // Deletion wins unless the live side causally dominates it.
            (true, false) => {
                if remote.vector_clock.dominates(&local.vector_clock) {
                    Some(remote.clone())
                } else {
                    Some(local.clone())
                }
            }
            (false, true) => {
                if local.vector_clock.dominates(&remote.vector_clock) {
                    Some(local.clone())
                } else {
                    Some(remote.clone())
                }
            }
        }
    }
}

/// Default strategy: causal order decides, deterministic tiebreak on origin
/// for concurrent writes.
fn vector_dominance(local: &Record, remote: &Record) -> Record {
    if local.vector_clock.wins_over(
        &remote.vector_clock,
        &local.origin,
        &remote.origin,
    ) {
        local.clone()
    } else {
        remote.clone()
    }
}

/// Prefer the causally *earlier* write; concurrent tiebreak is the reverse
/// of vector-dominance so the two strategies never agree by accident.
fn first_write_wins(local: &Record, remote: &Record) -> Record {
    match local.vector_clock.compare(&remote.vector_clock) {
        ClockRelation::Before | ClockRelation::Identical => local.clone(),
        ClockRelation::After => remote.clone(),
        ClockRelation::Concurrent => {
            if local.origin > remote.origin {
                local.clone()
            } else {
                remote.clone()
            }
        }
    }
}

/// Merge two object values field by field.
///
/// Keys present on one side only are copied. Keys present on both sides are
/// decided by the causal relation of the whole records; concurrent records
/// decide each contested field by origin order. Non-object values fall back
/// to vector-dominance.
fn merge_fields(local: &Record, remote: &Record) -> Record {
    let (JsonValue::Object(local_map), JsonValue::Object(remote_map)) =
        (&local.value, &remote.value)
    else {
        return vector_dominance(local, remote);
    };

    let relation = local.vector_clock.compare(&remote.vector_clock);
    let local_field_wins = match relation {
        ClockRelation::After | ClockRelation::Identical => true,
        ClockRelation::Before => false,
        ClockRelation::Concurrent => local.origin < remote.origin,
    };

    let mut merged: Map<String, JsonValue> = Map::new();
    for (key, value) in local_map {
        if !remote_map.contains_key(key) || local_field_wins {
            merged.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in remote_map {
        if !local_map.contains_key(key) || !local_field_wins {
            merged.insert(key.clone(), value.clone());
        }
    }

    let mut clock = local.vector_clock.clone();
    clock.merge(&remote.vector_clock);
    let origin = if local.origin <= remote.origin {
        local.origin.clone()
    } else {
        remote.origin.clone()
    };
    Record::new(JsonValue::Object(merged), clock, origin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::error::MeshError;
    use serde_json::json;

    fn record(value: JsonValue, entries: &[(&str, u64)], origin: &str) -> Record {
        let mut clock = VectorClock::new();
        for (node, n) in entries {
            clock.counters.insert(node.to_string(), *n);
        }
        Record::new(value, clock, origin)
    }

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(ConflictStrategy::VectorDominance, [])
    }

    #[test]
    fn test_dominant_local_wins() {
        let local = record(json!("new"), &[("n1", 2)], "n1");
        let remote = record(json!("old"), &[("n1", 1)], "n2");
        let winner = resolver().resolve("k", &local, &remote);
        assert_eq!(winner.value, json!("new"));
    }

    #[test]
    fn test_dominant_remote_wins() {
        let local = record(json!("old"), &[("n1", 1)], "n1");
        let remote = record(json!("new"), &[("n1", 1), ("n2", 1)], "n2");
        let winner = resolver().resolve("k", &local, &remote);
        assert_eq!(winner.value, json!("new"));
    }

    #[test]
    fn test_concurrent_tiebreak_on_origin() {
        let local = record(json!("A"), &[("n1", 1)], "n1");
        let remote = record(json!("B"), &[("n2", 1)], "n2");
        // "n1" < "n2": n1's write wins on both sides.
        let winner = resolver().resolve("k", &local, &remote);
        assert_eq!(winner.value, json!("A"));
        let winner = resolver().resolve("k", &remote, &local);
        assert_eq!(winner.value, json!("A"));
    }

    #[test]
    fn test_first_write_wins_prefers_dominated() {
        let r = ConflictResolver::new(ConflictStrategy::FirstWriteWins, []);
        let earlier = record(json!("first"), &[("n1", 1)], "n1");
        let later = record(json!("second"), &[("n1", 2)], "n1");
        assert_eq!(r.resolve("k", &earlier, &later).value, json!("first"));
        assert_eq!(r.resolve("k", &later, &earlier).value, json!("first"));
    }

    #[test]
    fn test_first_write_wins_reversed_tiebreak() {
        let r = ConflictResolver::new(ConflictStrategy::FirstWriteWins, []);
        let a = record(json!("A"), &[("n1", 1)], "n1");
        let b = record(json!("B"), &[("n2", 1)], "n2");
        // Reverse of vector-dominance: the larger origin wins.
        assert_eq!(r.resolve("k", &a, &b).value, json!("B"));
        assert_eq!(r.resolve("k", &b, &a).value, json!("B"));
    }

    #[test]
    fn test_merge_fields_union() {
        let r = ConflictResolver::new(ConflictStrategy::MergeFields, []);
        let local = record(json!({"a": 1, "shared": "local"}), &[("n1", 1)], "n1");
        let remote = record(json!({"b": 2, "shared": "remote"}), &[("n2", 1)], "n2");
        let merged = r.resolve("k", &local, &remote);
        assert_eq!(merged.value["a"], json!(1));
        assert_eq!(merged.value["b"], json!(2));
        // Concurrent records: contested field goes to the smaller origin.
        assert_eq!(merged.value["shared"], json!("local"));
        // Merged clock covers both writers.
        assert_eq!(merged.vector_clock.get("n1"), 1);
        assert_eq!(merged.vector_clock.get("n2"), 1);
    }

    #[test]
    fn test_merge_fields_dominant_side_takes_contested() {
        let r = ConflictResolver::new(ConflictStrategy::MergeFields, []);
        let local = record(json!({"shared": "old"}), &[("n1", 1)], "n1");
        let remote = record(json!({"shared": "new"}), &[("n1", 1), ("n2", 1)], "n2");
        assert_eq!(r.resolve("k", &local, &remote).value["shared"], json!("new"));
    }

    #[test]
    fn test_merge_fields_non_object_falls_back() {
        let r = ConflictResolver::new(ConflictStrategy::MergeFields, []);
        let local = record(json!([1, 2]), &[("n1", 2)], "n1");
        let remote = record(json!({"a": 1}), &[("n1", 1)], "n2");
        assert_eq!(r.resolve("k", &local, &remote).value, json!([1, 2]));
    }

    #[test]
    fn test_deletion_beats_concurrent_update() {
        let tomb = record(JsonValue::Null, &[("n1", 2)], "n1");
        let update = record(json!("alive"), &[("n2", 2)], "n2");
        let winner = resolver().resolve("k", &tomb, &update);
        assert!(winner.is_tombstone());
        let winner = resolver().resolve("k", &update, &tomb);
        assert!(winner.is_tombstone());
    }

    #[test]
    fn test_dominant_update_beats_deletion() {
        let tomb = record(JsonValue::Null, &[("n1", 1)], "n1");
        let update = record(json!("revived"), &[("n1", 2)], "n2");
        let winner = resolver().resolve("k", &tomb, &update);
        assert_eq!(winner.value, json!("revived"));
    }

    #[test]
    fn test_two_tombstones_resolve_by_dominance() {
        let older = record(JsonValue::Null, &[("n1", 1)], "n1");
        let newer = record(JsonValue::Null, &[("n1", 2)], "n2");
        let winner = resolver().resolve("k", &older, &newer);
        assert_eq!(winner.vector_clock.get("n1"), 2);
    }

    #[test]
    fn test_longest_prefix_strategy_selection() {
        let r = ConflictResolver::new(
            ConflictStrategy::VectorDominance,
            [
                ("app".to_string(), ConflictStrategy::FirstWriteWins),
                ("app/settings".to_string(), ConflictStrategy::MergeFields),
            ],
        );
        assert_eq!(r.strategy_for("app/settings/ui"), ConflictStrategy::MergeFields);
        assert_eq!(r.strategy_for("app/other"), ConflictStrategy::FirstWriteWins);
        assert_eq!(r.strategy_for("elsewhere"), ConflictStrategy::VectorDominance);
    }

    #[test]
    fn test_custom_resolver_runs_and_falls_back() {
        let r = resolver();
        r.register_resolver(
            "scores",
            Arc::new(|_path: &str, local: &Record, remote: &Record| {
                let sum = local.value.as_i64().unwrap_or(0) + remote.value.as_i64().unwrap_or(0);
                let mut clock = local.vector_clock.clone();
                clock.merge(&remote.vector_clock);
                Ok(Record::new(json!(sum), clock, local.origin.clone()))
            }),
        );

        let local = record(json!(3), &[("n1", 1)], "n1");
        let remote = record(json!(4), &[("n2", 1)], "n2");
        assert_eq!(r.resolve("scores/game1", &local, &remote).value, json!(7));

        // A failing resolver degrades to vector-dominance.
        r.register_resolver(
            "broken",
            Arc::new(|_: &str, _: &Record, _: &Record| {
                Err(MeshError::Resolver("boom".to_string()))
            }),
        );
        let local = record(json!("A"), &[("n1", 1)], "n1");
        let remote = record(json!("B"), &[("n2", 1)], "n2");
        assert_eq!(r.resolve("broken/k", &local, &remote).value, json!("A"));
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(
            ConflictStrategy::from_name("last-write-wins"),
            Some(ConflictStrategy::VectorDominance)
        );
        assert_eq!(
            ConflictStrategy::from_name("merge-fields"),
            Some(ConflictStrategy::MergeFields)
        );
        assert_eq!(ConflictStrategy::from_name("nope"), None);
        assert_eq!(ConflictStrategy::VectorDominance.name(), "vector-dominance");
    }
}
