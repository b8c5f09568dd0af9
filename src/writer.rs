/// The write pipeline: every write, local or remote, flows through here.
///
/// `handle_put` ingests a [`PutMessage`], deduplicates it, resolves any
/// conflict with the stored record, stamps the node's merged clock on the
/// winner, persists it, notifies subscribers, and re-broadcasts to peers
/// unless the write arrived via anti-entropy.
///
/// Locking follows the snapshot-commit pattern: causal state is touched only
/// under the node lock with no suspension point held, and store I/O runs
/// unlocked between the two critical sections.
use crate::clock::VectorClock;
use crate::envelope::SecurityEnvelope;
use crate::error::{MeshError, MeshResult};
use crate::node::NodeShared;
use crate::protocol::{PeerEvent, PutMessage};
use crate::types::{PutReceipt, Record};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Ingests local and remote writes.
#[derive(Clone)]
pub struct WriteProcessor {
    shared: Arc<NodeShared>,
}

impl WriteProcessor {
    pub(crate) fn new(shared: Arc<NodeShared>) -> Self {
        Self { shared }
    }

    /// Author a write on this node.
    ///
    /// Builds a fresh message carrying the local clock incremented for this
    /// node and runs it through the shared pipeline, which broadcasts it to
    /// the mesh.
    pub async fn local_put(&self, path: &str, value: JsonValue) -> MeshResult<PutReceipt> {
        let shared = &self.shared;
        if shared.is_shutting_down() {
            return Err(MeshError::ShuttingDown);
        }

        let clock = {
            let causal = shared.causal.lock().await;
            let mut clock = causal.clock.clone();
            clock.increment(&shared.node_id);
            clock
        };
        let message = PutMessage::local(
            path,
            value,
            SecurityEnvelope::generate_secure_id(),
            shared.node_id.clone(),
            clock,
        );

        match self.handle_put(message).await? {
            Some(record) => Ok(PutReceipt {
                path: path.to_string(),
                value: record.value,
                vector_clock: record.vector_clock,
            }),
            // A fresh msg_id can only be dropped by a shutdown race.
            None => Err(MeshError::ShuttingDown),
        }
    }

    /// Soft-delete: a local write of `null` that replicates as a tombstone.
    pub async fn local_delete(&self, path: &str) -> MeshResult<PutReceipt> {
        self.local_put(path, JsonValue::Null).await
    }

    /// Run a write through the full pipeline.
    ///
    /// Returns the committed record, or `None` when the message was dropped
    /// (duplicate, loop, or shutdown).
    pub async fn handle_put(&self, message: PutMessage) -> MeshResult<Option<Record>> {
        let shared = &self.shared;
        if shared.is_shutting_down() {
            return Ok(None);
        }
        if message.visited_servers.contains(&shared.node_id) {
            debug!(msg_id = %message.msg_id, "dropping looped message");
            return Ok(None);
        }
        // Check-and-record in one step so two racing deliveries of the same
        // message cannot both pass.
        if shared
            .recent
            .insert(message.msg_id.clone(), Instant::now())
            .is_some()
        {
            debug!(msg_id = %message.msg_id, "dropping duplicate message");
            return Ok(None);
        }

        {
            let mut causal = shared.causal.lock().await;
            causal.known_nodes.insert(message.origin.clone());
        }

        let incoming_clock = message
            .vector_clock
            .clone()
            .unwrap_or_else(|| VectorClock::singleton(message.origin.clone(), 1));
        let incoming = Record::new(
            message.value.clone(),
            incoming_clock.clone(),
            message.origin.clone(),
        );

        // Store I/O happens outside the node lock.
        let existing = shared.store.get(&message.path).await?;
        let mut committed = match existing {
            Some(existing) => {
                shared.versions.append(&message.path, existing.clone());
                shared.resolver.resolve(&message.path, &existing, &incoming)
            }
            None => incoming,
        };

        let committed_clock = {
            let mut causal = shared.causal.lock().await;
            causal.clock.merge(&incoming_clock);
            if message.origin == shared.node_id {
                causal.clock.increment(&shared.node_id);
            }
            causal.clock.ensure_known(&shared.node_id);
            let known: Vec<String> = causal.known_nodes.iter().cloned().collect();
            for node_id in &known {
                causal.clock.ensure_known(node_id);
            }
            causal.clock.clone()
        };

        committed.vector_clock = committed_clock.clone();
        shared.store.put(&message.path, committed.clone()).await?;

        shared.subscriptions.notify(&message.path, &committed.value);

        if !shared.is_shutting_down() && !message.anti_entropy {
            self.propagate(message, committed_clock).await;
        }

        Ok(Some(committed))
    }

    /// Re-broadcast a processed write with the committed clock and this
    /// node appended to the visited set. Send failures are logged and
    /// swallowed; the write is already durable locally.
    async fn propagate(&self, mut message: PutMessage, committed_clock: VectorClock) {
        let shared = &self.shared;
        let forwarded = message.origin != shared.node_id;
        message.vector_clock = Some(committed_clock);
        message.visited_servers.push(shared.node_id.clone());
        message.hop_count = Some(message.hop_count.unwrap_or(0) + 1);
        if forwarded {
            message.forwarded = Some(true);
        }

        let path = message.path.clone();
        match shared.seal(&PeerEvent::Put(message)) {
            Ok(envelope) => {
                if let Err(e) = shared.transport.broadcast(envelope).await {
                    warn!(path = %path, error = %e, "broadcast failed");
                }
            }
            Err(e) => warn!(path = %path, error = %e, "could not seal outbound write"),
        }
    }

    /// Drop remembered message ids older than the retention window.
    pub fn sweep_recent(&self) {
        let max_age = self.shared.config.sync.max_message_age;
        self.shared.recent.retain(|_, seen_at| seen_at.elapsed() <= max_age);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::node::NodeShared;
    use crate::store::MemoryStore;
    use crate::transport::MemoryHub;
    use serde_json::json;

    async fn writer(node_id: &str) -> (WriteProcessor, Arc<NodeShared>) {
        let hub = MemoryHub::new();
        let (transport, _rx) = hub.attach(node_id);
        let config = NodeConfig::new(node_id).insecure();
        let shared = NodeShared::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(transport),
        )
        .unwrap();
        (WriteProcessor::new(shared.clone()), shared)
    }

    fn remote_put(path: &str, value: JsonValue, msg_id: &str, origin: &str, n: u64) -> PutMessage {
        PutMessage {
            path: path.to_string(),
            value,
            msg_id: msg_id.to_string(),
            origin: origin.to_string(),
            vector_clock: Some(VectorClock::singleton(origin, n)),
            visited_servers: vec![origin.to_string()],
            hop_count: Some(1),
            forwarded: None,
            anti_entropy: false,
        }
    }

    #[tokio::test]
    async fn test_local_put_increments_own_clock() {
        let (writer, shared) = writer("n1").await;

        let first = writer.local_put("k", json!(1)).await.unwrap();
        let second = writer.local_put("k", json!(2)).await.unwrap();

        assert!(second.vector_clock.get("n1") > first.vector_clock.get("n1"));
        let stored = shared.store.get("k").await.unwrap().unwrap();
        assert_eq!(stored.value, json!(2));
    }

    #[tokio::test]
    async fn test_duplicate_msg_id_is_dropped() {
        let (writer, shared) = writer("n1").await;

        let msg = remote_put("k", json!("first"), "m1", "n2", 1);
        assert!(writer.handle_put(msg).await.unwrap().is_some());

        // Same id, different content: must not be applied.
        let replay = remote_put("k", json!("evil-replay"), "m1", "n2", 9);
        assert!(writer.handle_put(replay).await.unwrap().is_none());

        let stored = shared.store.get("k").await.unwrap().unwrap();
        assert_eq!(stored.value, json!("first"));
    }

    #[tokio::test]
    async fn test_visited_set_stops_loops() {
        let (writer, shared) = writer("n1").await;

        let mut msg = remote_put("k", json!(1), "m1", "n2", 1);
        msg.visited_servers.push("n1".to_string());
        assert!(writer.handle_put(msg).await.unwrap().is_none());
        assert!(shared.store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_clock_becomes_origin_singleton() {
        let (writer, _shared) = writer("n1").await;

        let mut msg = remote_put("k", json!(1), "m1", "n2", 1);
        msg.vector_clock = None;
        let committed = writer.handle_put(msg).await.unwrap().unwrap();
        assert_eq!(committed.vector_clock.get("n2"), 1);
    }

    #[tokio::test]
    async fn test_inbound_clock_merged_pointwise() {
        let (writer, shared) = writer("n1").await;

        let mut msg = remote_put("k", json!(1), "m1", "n2", 3);
        msg.vector_clock
            .as_mut()
            .unwrap()
            .counters
            .insert("n3".to_string(), 5);
        writer.handle_put(msg).await.unwrap();

        let causal = shared.causal.lock().await;
        assert!(causal.clock.get("n2") >= 3);
        assert!(causal.clock.get("n3") >= 5);
        // Every known node has a key, including ourselves.
        assert!(causal.clock.counters.contains_key("n1"));
    }

    #[tokio::test]
    async fn test_superseded_record_lands_in_history() {
        let (writer, shared) = writer("n1").await;

        writer.local_put("k", json!("v1")).await.unwrap();
        writer.local_put("k", json!("v2")).await.unwrap();

        let history = shared.versions.history("k");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].value, json!("v1"));
    }

    #[tokio::test]
    async fn test_conflict_resolution_applies() {
        let (writer, shared) = writer("n1").await;

        // A dominated remote write must not clobber a newer local one.
        writer.local_put("k", json!("local")).await.unwrap();
        let stale = remote_put("k", json!("stale"), "m1", "zz", 0);
        writer.handle_put(stale).await.unwrap();

        let stored = shared.store.get("k").await.unwrap().unwrap();
        assert_eq!(stored.value, json!("local"));
    }

    #[tokio::test]
    async fn test_broadcast_suppressed_for_anti_entropy() {
        let hub = MemoryHub::new();
        let (transport, _rx) = hub.attach("n1");
        let (_observer, mut observer_rx) = hub.attach("observer");
        let shared = NodeShared::new(
            NodeConfig::new("n1").insecure(),
            Arc::new(MemoryStore::new()),
            Arc::new(transport),
        )
        .unwrap();
        let writer = WriteProcessor::new(shared);

        let mut msg = remote_put("k", json!(1), "m1", "n2", 1);
        msg.anti_entropy = true;
        writer.handle_put(msg).await.unwrap();
        assert!(observer_rx.try_recv().is_err());

        // A regular write does reach the mesh.
        writer.local_put("k2", json!(2)).await.unwrap();
        assert!(observer_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_rejected_after_shutdown() {
        let (writer, shared) = writer("n1").await;
        shared
            .shutting_down
            .store(true, std::sync::atomic::Ordering::SeqCst);

        assert!(matches!(
            writer.local_put("k", json!(1)).await,
            Err(MeshError::ShuttingDown)
        ));
        let msg = remote_put("k", json!(1), "m1", "n2", 1);
        assert!(writer.handle_put(msg).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_recent_respects_age() {
        let (writer, shared) = writer("n1").await;
        writer
            .handle_put(remote_put("k", json!(1), "m1", "n2", 1))
            .await
            .unwrap();
        assert_eq!(shared.recent.len(), 1);

        // Entries younger than the window survive a sweep.
        writer.sweep_recent();
        assert_eq!(shared.recent.len(), 1);
    }
}
