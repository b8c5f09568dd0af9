/// Pull-based anti-entropy reconciliation.
///
/// Nodes that missed updates while disconnected converge once reconnected,
/// regardless of wall clock: a run exchanges vector clocks with every peer,
/// then pulls each peer's records for a path prefix and feeds them back into
/// the write pipeline with the `antiEntropy` marker set, which suppresses
/// re-broadcast.
///
/// Runs are serialized per node and paced by an adaptive backoff:
///
/// ```text
/// Idle --run()--> CanRun? --yes--> Running --success--> Idle (backoff shrinks)
///                     |                    \--failure--> Idle (backoff doubles)
///                     \--no--> Idle (skip counted)
/// ```
use crate::error::{MeshError, MeshResult};
use crate::node::NodeShared;
use crate::protocol::{
    AntiEntropyRequest, AntiEntropyResponse, Change, ClockSync, ClockSyncResponse, PeerEvent,
    PutMessage,
};
use crate::writer::WriteProcessor;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lower clamp of the inter-run backoff.
pub const MIN_BACKOFF: Duration = Duration::from_secs(1);

/// Upper clamp of the inter-run backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Records per anti-entropy response batch.
const BATCH_SIZE: usize = 50;

/// Pause between batches, bounding the network burst a large scan causes.
const BATCH_PAUSE: Duration = Duration::from_millis(50);

/// Idle span after which the next successful run halves the backoff.
const LONG_IDLE: Duration = Duration::from_secs(60);

struct RunState {
    is_running: bool,
    last_run: Option<Instant>,
    consecutive_skips: u64,
    backoff: Duration,
}

/// Snapshot of the reconciliation state, for introspection.
#[derive(Debug, Clone)]
pub struct AntiEntropyStatus {
    /// True while a run is in flight.
    pub is_running: bool,
    /// Runs skipped since the last one that executed.
    pub consecutive_skips: u64,
    /// Current inter-run backoff.
    pub backoff: Duration,
}

/// Periodic pull-based reconciliation engine.
pub struct AntiEntropy {
    shared: Arc<NodeShared>,
    writer: WriteProcessor,
    state: Mutex<RunState>,
}

impl AntiEntropy {
    pub(crate) fn new(shared: Arc<NodeShared>, writer: WriteProcessor) -> Self {
        Self {
            shared,
            writer,
            state: Mutex::new(RunState {
                is_running: false,
                last_run: None,
                consecutive_skips: 0,
                backoff: MIN_BACKOFF,
            }),
        }
    }

    /// Execute one reconciliation run for a path prefix (empty = all).
    ///
    /// Returns `Ok(false)` when the run was skipped because another run is
    /// in flight or the backoff window has not elapsed; `force` bypasses
    /// both gates (used by the manual API).
    pub async fn run(&self, path: &str, force: bool) -> MeshResult<bool> {
        if self.shared.is_shutting_down() {
            return Err(MeshError::ShuttingDown);
        }

        let idle_before = {
            let mut state = self.state.lock().await;
            if state.is_running && !force {
                state.consecutive_skips += 1;
                return Ok(false);
            }
            if let Some(last_run) = state.last_run {
                if last_run.elapsed() < state.backoff && !force {
                    state.consecutive_skips += 1;
                    return Ok(false);
                }
            }
            state.is_running = true;
            state.last_run.map(|last| last.elapsed())
        };

        let result = self.cycle(path).await;

        let mut state = self.state.lock().await;
        state.is_running = false;
        state.last_run = Some(Instant::now());
        match &result {
            Ok(()) => {
                state.consecutive_skips = 0;
                state.backoff = state.backoff.mul_f64(0.8).max(MIN_BACKOFF);
                if idle_before.is_some_and(|idle| idle > LONG_IDLE) {
                    state.backoff = (state.backoff / 2).max(MIN_BACKOFF);
                }
            }
            Err(_) => {
                state.backoff = (state.backoff * 2).min(MAX_BACKOFF);
            }
        }
        result.map(|()| true)
    }

    async fn cycle(&self, path: &str) -> MeshResult<()> {
        let peers = self.shared.transport.peer_ids();
        if peers.is_empty() {
            return Ok(());
        }

        // Bring causal metadata current before pulling data.
        self.sync_clocks().await?;

        let clock = self.shared.clock_snapshot().await;
        let mut delivered = 0usize;
        for peer_id in &peers {
            if self.shared.is_shutting_down() {
                return Ok(());
            }
            let request = PeerEvent::AntiEntropyRequest(AntiEntropyRequest {
                request_id: Uuid::new_v4().to_string(),
                node_id: self.shared.node_id.clone(),
                vector_clock: clock.clone(),
                timestamp: Utc::now(),
                path: path.to_string(),
                is_anti_entropy: true,
            });
            match self.shared.emit(peer_id, &request).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(peer = %peer_id, error = %e, "anti-entropy request failed"),
            }
        }
        if delivered == 0 {
            return Err(MeshError::Transport(
                "anti-entropy request reached no peer".to_string(),
            ));
        }

        // Final pairwise clock pass; responses keep trickling in after the
        // run returns.
        self.sync_clocks().await
    }

    /// Push this node's clock to every peer. Also used on its own by the
    /// short-interval clock exchange.
    pub async fn sync_clocks(&self) -> MeshResult<()> {
        let clock = self.shared.clock_snapshot().await;
        for peer_id in self.shared.transport.peer_ids() {
            let sync = PeerEvent::VectorClockSync(ClockSync {
                vector_clock: clock.clone(),
                node_id: self.shared.node_id.clone(),
                timestamp: Utc::now(),
                sync_id: Uuid::new_v4().to_string(),
                is_anti_entropy: true,
            });
            if let Err(e) = self.shared.emit(&peer_id, &sync).await {
                debug!(peer = %peer_id, error = %e, "clock sync emit failed");
            }
        }
        Ok(())
    }

    /// Peer side of the clock exchange: merge and answer with the merged
    /// clock.
    pub(crate) async fn handle_clock_sync(&self, message: ClockSync) {
        let merged = self
            .shared
            .merge_clock(&message.vector_clock, &message.node_id)
            .await;
        let response = PeerEvent::VectorClockSyncResponse(ClockSyncResponse {
            vector_clock: merged,
            node_id: self.shared.node_id.clone(),
            timestamp: Utc::now(),
            in_response_to: message.sync_id,
            is_anti_entropy: message.is_anti_entropy,
        });
        if let Err(e) = self.shared.emit(&message.node_id, &response).await {
            debug!(peer = %message.node_id, error = %e, "clock sync response failed");
        }
    }

    /// Requester side of the clock exchange: merge the responder's clock.
    pub(crate) async fn handle_clock_sync_response(&self, message: ClockSyncResponse) {
        self.shared
            .merge_clock(&message.vector_clock, &message.node_id)
            .await;
    }

    /// Peer side of a pull: merge the requester's clock, scan the store,
    /// and stream the records back in bounded batches.
    pub(crate) async fn handle_request(&self, message: AntiEntropyRequest) {
        let merged = self
            .shared
            .merge_clock(&message.vector_clock, &message.node_id)
            .await;

        // A store failure aborts this response but never the node.
        let entries = match self.shared.store.scan(&message.path).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %message.path, error = %e, "anti-entropy scan failed");
                return;
            }
        };

        let response_id = Uuid::new_v4().to_string();
        let total_batches = entries.len().div_ceil(BATCH_SIZE).max(1);
        let mut batches = entries.chunks(BATCH_SIZE);

        for batch_index in 0..total_batches {
            if self.shared.is_shutting_down() {
                return;
            }
            if batch_index > 0 {
                sleep(BATCH_PAUSE).await;
            }
            let changes: Vec<Change> = batches
                .next()
                .unwrap_or(&[])
                .iter()
                .map(|(path, record)| Change {
                    path: path.clone(),
                    value: record.value.clone(),
                    vector_clock: record.vector_clock.clone(),
                    origin: record.origin.clone(),
                    timestamp: None,
                })
                .collect();

            let response = PeerEvent::AntiEntropyResponse(AntiEntropyResponse {
                response_id: response_id.clone(),
                node_id: self.shared.node_id.clone(),
                vector_clock: merged.clone(),
                timestamp: Utc::now(),
                batch_index,
                total_batches,
                changes,
                is_anti_entropy: true,
            });
            if let Err(e) = self.shared.emit(&message.node_id, &response).await {
                warn!(peer = %message.node_id, error = %e, "anti-entropy batch send failed");
                return;
            }
        }
    }

    /// Requester side of a pull: merge the responder's clock and feed every
    /// record through the write pipeline with re-broadcast suppressed.
    pub(crate) async fn handle_response(&self, message: AntiEntropyResponse) {
        self.shared
            .merge_clock(&message.vector_clock, &message.node_id)
            .await;

        for change in message.changes {
            if self.shared.is_shutting_down() {
                return;
            }
            let put = PutMessage {
                msg_id: format!("anti-entropy-{}-{}", message.response_id, change.path),
                path: change.path,
                value: change.value,
                origin: change.origin,
                vector_clock: Some(change.vector_clock),
                visited_servers: Vec::new(),
                hop_count: None,
                forwarded: None,
                anti_entropy: true,
            };
            // One bad record never halts the rest of the batch.
            if let Err(e) = self.writer.handle_put(put).await {
                warn!(error = %e, "anti-entropy change rejected");
            }
        }
    }

    /// Current reconciliation state.
    pub async fn status(&self) -> AntiEntropyStatus {
        let state = self.state.lock().await;
        AntiEntropyStatus {
            is_running: state.is_running,
            consecutive_skips: state.consecutive_skips,
            backoff: state.backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::config::NodeConfig;
    use crate::store::MemoryStore;
    use crate::transport::{InboundMessage, MemoryHub};
    use crate::types::Record;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn engine(
        node_id: &str,
        hub: &Arc<MemoryHub>,
    ) -> (Arc<AntiEntropy>, Arc<NodeShared>, UnboundedReceiver<InboundMessage>) {
        let (transport, rx) = hub.attach(node_id);
        let shared = NodeShared::new(
            NodeConfig::new(node_id).insecure(),
            Arc::new(MemoryStore::new()),
            Arc::new(transport),
        )
        .unwrap();
        let writer = WriteProcessor::new(shared.clone());
        (
            Arc::new(AntiEntropy::new(shared.clone(), writer)),
            shared,
            rx,
        )
    }

    fn decode(envelope: crate::envelope::CipherEnvelope) -> PeerEvent {
        match envelope {
            crate::envelope::CipherEnvelope::Plain(plain) => {
                serde_json::from_value(plain.data).unwrap()
            }
            _ => panic!("expected plain envelope in insecure test"),
        }
    }

    #[tokio::test]
    async fn test_backoff_gates_scheduled_runs() {
        let hub = MemoryHub::new();
        let (engine, _shared, _rx) = engine("n1", &hub).await;

        // No peers: the cycle trivially succeeds.
        assert!(engine.run("", false).await.unwrap());
        // Immediately after, the backoff window has not elapsed.
        assert!(!engine.run("", false).await.unwrap());
        let status = engine.status().await;
        assert_eq!(status.consecutive_skips, 1);

        // A forced run bypasses the gate and resets the skip counter.
        assert!(engine.run("", true).await.unwrap());
        assert_eq!(engine.status().await.consecutive_skips, 0);
    }

    #[tokio::test]
    async fn test_backoff_stays_clamped() {
        let hub = MemoryHub::new();
        let (engine, _shared, _rx) = engine("n1", &hub).await;
        for _ in 0..20 {
            engine.run("", true).await.unwrap();
        }
        let status = engine.status().await;
        assert!(status.backoff >= MIN_BACKOFF);
        assert!(status.backoff <= MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_request_scans_into_bounded_batches() {
        let hub = MemoryHub::new();
        let (responder, shared, _responder_rx) = engine("resp", &hub).await;
        let (_requester_engine, _req_shared, mut requester_rx) = engine("req", &hub).await;

        for i in 0..120 {
            shared
                .store
                .put(
                    &format!("data/{:03}", i),
                    Record::new(json!(i), VectorClock::singleton("resp", 1), "resp"),
                )
                .await
                .unwrap();
        }

        responder
            .handle_request(AntiEntropyRequest {
                request_id: "r1".to_string(),
                node_id: "req".to_string(),
                vector_clock: VectorClock::singleton("req", 4),
                timestamp: Utc::now(),
                path: "data".to_string(),
                is_anti_entropy: true,
            })
            .await;

        let mut sizes = Vec::new();
        while let Ok((_, envelope)) = requester_rx.try_recv() {
            if let PeerEvent::AntiEntropyResponse(resp) = decode(envelope) {
                assert_eq!(resp.total_batches, 3);
                sizes.push(resp.changes.len());
            }
        }
        assert_eq!(sizes, vec![50, 50, 20]);

        // The requester's clock was merged on receipt of the request.
        let causal = shared.causal.lock().await;
        assert_eq!(causal.clock.get("req"), 4);
    }

    #[tokio::test]
    async fn test_empty_scan_still_answers() {
        let hub = MemoryHub::new();
        let (responder, _shared, _rx) = engine("resp", &hub).await;
        let (_req, _req_shared, mut requester_rx) = engine("req", &hub).await;

        responder
            .handle_request(AntiEntropyRequest {
                request_id: "r1".to_string(),
                node_id: "req".to_string(),
                vector_clock: VectorClock::new(),
                timestamp: Utc::now(),
                path: "nothing/here".to_string(),
                is_anti_entropy: true,
            })
            .await;

        let (_, envelope) = requester_rx.try_recv().unwrap();
        match decode(envelope) {
            PeerEvent::AntiEntropyResponse(resp) => {
                assert!(resp.changes.is_empty());
                assert_eq!(resp.total_batches, 1);
            }
            other => panic!("expected response, got {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_response_feeds_pipeline_without_rebroadcast() {
        let hub = MemoryHub::new();
        let (engine, shared, _rx) = engine("n1", &hub).await;
        let (_observer, mut observer_rx) = hub.attach("observer");

        engine
            .handle_response(AntiEntropyResponse {
                response_id: "resp-1".to_string(),
                node_id: "n2".to_string(),
                vector_clock: VectorClock::singleton("n2", 2),
                timestamp: Utc::now(),
                batch_index: 0,
                total_batches: 1,
                changes: vec![Change {
                    path: "synced/k".to_string(),
                    value: json!({"v": 1}),
                    vector_clock: VectorClock::singleton("n2", 2),
                    origin: "n2".to_string(),
                    timestamp: None,
                }],
                is_anti_entropy: true,
            })
            .await;

        let stored = shared.store.get("synced/k").await.unwrap().unwrap();
        assert_eq!(stored.value, json!({"v": 1}));
        // antiEntropy writes are never re-broadcast.
        assert!(observer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_clock_sync_round_trip() {
        let hub = MemoryHub::new();
        let (a_engine, a_shared, mut a_rx) = engine("a", &hub).await;
        let (b_engine, b_shared, mut b_rx) = engine("b", &hub).await;

        {
            let mut causal = a_shared.causal.lock().await;
            causal.clock.counters.insert("a".to_string(), 5);
        }

        a_engine.sync_clocks().await.unwrap();
        let (_, envelope) = b_rx.try_recv().unwrap();
        match decode(envelope) {
            PeerEvent::VectorClockSync(sync) => b_engine.handle_clock_sync(sync).await,
            other => panic!("expected clock sync, got {}", other.name()),
        }
        assert_eq!(b_shared.causal.lock().await.clock.get("a"), 5);

        // The responder's merged clock flows back and is merged again.
        let (_, envelope) = a_rx.try_recv().unwrap();
        match decode(envelope) {
            PeerEvent::VectorClockSyncResponse(resp) => {
                a_engine.handle_clock_sync_response(resp).await
            }
            other => panic!("expected clock sync response, got {}", other.name()),
        }
        let causal = a_shared.causal.lock().await;
        assert!(causal.clock.counters.contains_key("b"));
    }
}
