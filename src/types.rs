/// Common types used throughout meshkv.
///
/// This module defines the core data structures of the replication engine:
/// the persisted record triple, API receipts, and the path prefix relations
/// that drive subscriptions and conflict strategy selection.
///
/// A path is a slash-delimited string treated as an opaque hierarchical key
/// (`"a/b/c"`). There are no wildcards; prefix matching is the "is child of"
/// relation on whole segments, so `"app/user"` is an ancestor of
/// `"app/user/1"` but not of `"app/users"`.
use crate::clock::VectorClock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A persisted record: the value at a path plus its causal metadata.
///
/// A record with `value == null` is a tombstone: the path is deleted but the
/// record and its vector clock persist so that deletion can win (or lose)
/// conflict resolution against concurrent updates.
///
/// The same triple is used for entries in the per-path version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// The stored value. `null` marks a tombstone.
    pub value: JsonValue,
    /// Causal metadata stamped at commit time.
    pub vector_clock: VectorClock,
    /// NodeId that authored this value.
    pub origin: String,
}

impl Record {
    /// Create a new record.
    pub fn new(value: JsonValue, vector_clock: VectorClock, origin: impl Into<String>) -> Self {
        Self {
            value,
            vector_clock,
            origin: origin.into(),
        }
    }

    /// Create a tombstone record marking a deletion.
    pub fn tombstone(vector_clock: VectorClock, origin: impl Into<String>) -> Self {
        Self::new(JsonValue::Null, vector_clock, origin)
    }

    /// True if this record marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_null()
    }
}

/// Receipt returned by a successful local write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutReceipt {
    /// The path that was written.
    pub path: String,
    /// The committed value (post conflict resolution).
    pub value: JsonValue,
    /// The vector clock stamped on the committed record.
    pub vector_clock: VectorClock,
}

/// One entry returned by a prefix scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanEntry {
    /// The full path of the entry.
    pub path: String,
    /// The current value at the path.
    pub value: JsonValue,
}

/// Split a path into its segments, ignoring empty segments from leading,
/// trailing, or doubled slashes.
pub fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// True if `prefix` is an ancestor of `path` or equal to it, on whole
/// segments. The empty prefix is an ancestor of everything.
pub fn is_ancestor_or_equal(prefix: &str, path: &str) -> bool {
    let prefix_segs = path_segments(prefix);
    let path_segs = path_segments(path);
    if prefix_segs.len() > path_segs.len() {
        return false;
    }
    prefix_segs
        .iter()
        .zip(path_segs.iter())
        .all(|(a, b)| a == b)
}

/// True if one of the two paths is an ancestor of (or equal to) the other.
///
/// This is the subscription match relation: changing a parent notifies
/// descendant-path subscribers and changing a descendant notifies
/// parent-path subscribers.
pub fn paths_related(a: &str, b: &str) -> bool {
    is_ancestor_or_equal(a, b) || is_ancestor_or_equal(b, a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_tombstone() {
        let rec = Record::tombstone(VectorClock::new(), "n1");
        assert!(rec.is_tombstone());

        let rec = Record::new(json!({"a": 1}), VectorClock::new(), "n1");
        assert!(!rec.is_tombstone());
    }

    #[test]
    fn test_record_wire_shape() {
        let rec = Record::new(json!(42), VectorClock::singleton("n1", 3), "n1");
        let wire = serde_json::to_value(&rec).unwrap();
        assert_eq!(wire["value"], json!(42));
        assert_eq!(wire["vectorClock"], json!({"n1": 3}));
        assert_eq!(wire["origin"], json!("n1"));
    }

    #[test]
    fn test_path_segments() {
        assert_eq!(path_segments("a/b/c"), vec!["a", "b", "c"]);
        assert_eq!(path_segments("/a//b/"), vec!["a", "b"]);
        assert!(path_segments("").is_empty());
    }

    #[test]
    fn test_ancestor_matching_is_segment_wise() {
        assert!(is_ancestor_or_equal("app/user", "app/user/1"));
        assert!(is_ancestor_or_equal("app/user", "app/user"));
        assert!(is_ancestor_or_equal("", "anything/at/all"));
        assert!(!is_ancestor_or_equal("app/user", "app/users"));
        assert!(!is_ancestor_or_equal("app/user/1", "app/user"));
    }

    #[test]
    fn test_paths_related_is_bidirectional() {
        assert!(paths_related("app", "app/user/1"));
        assert!(paths_related("app/user/1", "app"));
        assert!(paths_related("app", "app"));
        assert!(!paths_related("app/user", "app/session"));
    }
}
