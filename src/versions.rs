/// Bounded per-path history of superseded records.
///
/// Every time a write replaces an existing record, the replaced record is
/// appended here. The history is ordered by causal dominance, most dominant
/// first, with concurrent or identical clocks broken by origin order.
/// Overflow drops the tail, which is the most dominated (causally oldest)
/// entry.
///
/// The store is an ephemeral aid for rollback tooling; it is not persisted
/// across restarts.
use crate::clock::ClockRelation;
use crate::types::Record;
use dashmap::DashMap;
use std::cmp::Ordering;

/// Default capacity of each path's history.
pub const DEFAULT_MAX_VERSIONS: usize = 10;

/// Per-path bounded version history.
#[derive(Debug)]
pub struct VersionStore {
    histories: DashMap<String, Vec<Record>>,
    max_versions: usize,
}

impl VersionStore {
    /// Create a store keeping at most `max_versions` entries per path.
    pub fn new(max_versions: usize) -> Self {
        Self {
            histories: DashMap::new(),
            max_versions: max_versions.max(1),
        }
    }

    /// Append a superseded record to a path's history, keeping causal order
    /// and the capacity bound.
    pub fn append(&self, path: &str, record: Record) {
        let mut history = self.histories.entry(path.to_string()).or_default();
        let position = history
            .iter()
            .position(|existing| causal_order(&record, existing) == Ordering::Less)
            .unwrap_or(history.len());
        history.insert(position, record);
        history.truncate(self.max_versions);
    }

    /// The history for a path, most dominant first.
    pub fn history(&self, path: &str) -> Vec<Record> {
        self.histories
            .get(path)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Number of retained versions for a path.
    pub fn len(&self, path: &str) -> usize {
        self.histories.get(path).map(|h| h.len()).unwrap_or(0)
    }

    /// Drop the history for a path.
    pub fn clear(&self, path: &str) {
        self.histories.remove(path);
    }
}

/// Causal sort order: dominant records sort first, concurrent and identical
/// clocks fall back to origin order.
fn causal_order(a: &Record, b: &Record) -> Ordering {
    match a.vector_clock.compare(&b.vector_clock) {
        ClockRelation::After => Ordering::Less,
        ClockRelation::Before => Ordering::Greater,
        ClockRelation::Concurrent | ClockRelation::Identical => a.origin.cmp(&b.origin),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use serde_json::json;

    fn record(n: u64, origin: &str) -> Record {
        Record::new(json!({"rev": n}), VectorClock::singleton("n1", n), origin)
    }

    #[test]
    fn test_history_ordered_by_dominance() {
        let store = VersionStore::new(10);
        store.append("k", record(1, "n1"));
        store.append("k", record(3, "n1"));
        store.append("k", record(2, "n1"));

        let history = store.history("k");
        let revs: Vec<u64> = history
            .iter()
            .map(|r| r.vector_clock.get("n1"))
            .collect();
        assert_eq!(revs, vec![3, 2, 1]);
    }

    #[test]
    fn test_overflow_drops_most_dominated() {
        let store = VersionStore::new(5);
        for n in 1..=6 {
            store.append("k", record(n, "n1"));
        }
        let history = store.history("k");
        assert_eq!(history.len(), 5);
        // The smallest-causality version (rev 1) was evicted.
        assert!(history.iter().all(|r| r.vector_clock.get("n1") >= 2));
    }

    #[test]
    fn test_concurrent_entries_break_on_origin() {
        let store = VersionStore::new(10);
        let a = Record::new(json!("A"), VectorClock::singleton("n1", 1), "n1");
        let b = Record::new(json!("B"), VectorClock::singleton("n2", 1), "n2");
        store.append("k", b.clone());
        store.append("k", a.clone());

        let history = store.history("k");
        assert_eq!(history[0].origin, "n1");
        assert_eq!(history[1].origin, "n2");
    }

    #[test]
    fn test_clear_and_isolation_between_paths() {
        let store = VersionStore::new(10);
        store.append("a", record(1, "n1"));
        store.append("b", record(1, "n1"));
        store.clear("a");
        assert_eq!(store.len("a"), 0);
        assert_eq!(store.len("b"), 1);
    }
}
