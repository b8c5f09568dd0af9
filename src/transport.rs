/// Transport abstraction for peer messaging.
///
/// The replication engine talks to its mesh only through the `Transport`
/// trait: emit an envelope to one peer, broadcast to all, list the peer set.
/// Delivery is best-effort and unordered; the engine's vector clocks and
/// anti-entropy loop carry correctness, never delivery order.
///
/// [`MemoryHub`] provides an in-process mesh so multiple nodes can run in
/// one address space (the integration tests host whole clusters this way).
/// Production deployments plug in their own transport behind the trait.
use crate::envelope::CipherEnvelope;
use crate::error::MeshResult;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// An envelope arriving from a peer, tagged with the sender's node id.
pub type InboundMessage = (String, CipherEnvelope);

/// A bidirectional best-effort message channel to a set of peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send an envelope to one peer. Unknown or unreachable peers are
    /// dropped silently; delivery is best-effort.
    async fn emit(&self, peer_id: &str, envelope: CipherEnvelope) -> MeshResult<()>;

    /// Send an envelope to every connected peer.
    async fn broadcast(&self, envelope: CipherEnvelope) -> MeshResult<()>;

    /// Ids of the currently connected peers.
    fn peer_ids(&self) -> Vec<String>;

    /// Disconnect from the mesh. Peers stop listing this node and messages
    /// addressed to it are dropped until it reconnects.
    async fn close(&self) -> MeshResult<()>;
}

/// An in-process mesh connecting every attached node to every other.
pub struct MemoryHub {
    mailboxes: DashMap<String, mpsc::UnboundedSender<InboundMessage>>,
}

impl MemoryHub {
    /// Create an empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mailboxes: DashMap::new(),
        })
    }

    /// Attach a node to the hub.
    ///
    /// Returns the node's transport handle and the receiver its dispatch
    /// loop drains. Re-attaching an id replaces the previous mailbox, which
    /// models a node restart.
    pub fn attach(
        self: &Arc<Self>,
        node_id: impl Into<String>,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<InboundMessage>) {
        let node_id = node_id.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.mailboxes.insert(node_id.clone(), sender);
        let transport = MemoryTransport {
            hub: Arc::clone(self),
            local_id: node_id,
        };
        (transport, receiver)
    }

    /// Detach a node, modelling it going offline. Messages sent to it are
    /// dropped until it re-attaches.
    pub fn detach(&self, node_id: &str) {
        self.mailboxes.remove(node_id);
    }

    fn deliver(&self, from: &str, to: &str, envelope: CipherEnvelope) {
        match self.mailboxes.get(to) {
            Some(mailbox) => {
                if mailbox.send((from.to_string(), envelope)).is_err() {
                    debug!(from, to, "peer mailbox closed, dropping message");
                }
            }
            None => debug!(from, to, "peer not attached, dropping message"),
        }
    }
}

/// A node's handle onto a [`MemoryHub`].
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    local_id: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn emit(&self, peer_id: &str, envelope: CipherEnvelope) -> MeshResult<()> {
        self.hub.deliver(&self.local_id, peer_id, envelope);
        Ok(())
    }

    async fn broadcast(&self, envelope: CipherEnvelope) -> MeshResult<()> {
        for peer_id in self.peer_ids() {
            self.hub.deliver(&self.local_id, &peer_id, envelope.clone());
        }
        Ok(())
    }

    fn peer_ids(&self) -> Vec<String> {
        self.hub
            .mailboxes
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| id != &self.local_id)
            .collect()
    }

    async fn close(&self) -> MeshResult<()> {
        self.hub.detach(&self.local_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(n: i64) -> CipherEnvelope {
        CipherEnvelope::plain(json!({"n": n}))
    }

    #[tokio::test]
    async fn test_emit_reaches_one_peer() {
        let hub = MemoryHub::new();
        let (t1, _rx1) = hub.attach("n1");
        let (_t2, mut rx2) = hub.attach("n2");
        let (_t3, mut rx3) = hub.attach("n3");

        t1.emit("n2", envelope(1)).await.unwrap();

        let (from, _) = rx2.recv().await.unwrap();
        assert_eq!(from, "n1");
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let hub = MemoryHub::new();
        let (t1, mut rx1) = hub.attach("n1");
        let (_t2, mut rx2) = hub.attach("n2");
        let (_t3, mut rx3) = hub.attach("n3");

        t1.broadcast(envelope(7)).await.unwrap();

        assert!(rx2.recv().await.is_some());
        assert!(rx3.recv().await.is_some());
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_unregisters_from_hub() {
        let hub = MemoryHub::new();
        let (t1, _rx1) = hub.attach("n1");
        let (t2, _rx2) = hub.attach("n2");

        t2.close().await.unwrap();
        assert!(t1.peer_ids().is_empty());

        // Best-effort: emitting to the departed peer is a silent drop.
        t1.emit("n2", envelope(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_detached_peer_drops_messages() {
        let hub = MemoryHub::new();
        let (t1, _rx1) = hub.attach("n1");
        let (_t2, _rx2) = hub.attach("n2");
        hub.detach("n2");

        // Best-effort: no error, the message just vanishes.
        t1.emit("n2", envelope(1)).await.unwrap();
        assert!(t1.peer_ids().is_empty());
    }
}
