/// Wire protocol: the named events exchanged between peers.
///
/// After the envelope layer is peeled off, every inter-node message is one
/// of these events, serialized as `{"event": <name>, "data": <payload>}`
/// with kebab-case event names and camelCase payload fields.
///
/// `timestamp` fields travel for observability only; causality is carried
/// exclusively by the vector clocks.
use crate::clock::VectorClock;
use crate::envelope::CipherEnvelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A protocol event with its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum PeerEvent {
    /// A replicated write, local or forwarded.
    Put(PutMessage),
    /// Push of a node's vector clock.
    VectorClockSync(ClockSync),
    /// Merged clock returned for a sync push.
    VectorClockSyncResponse(ClockSyncResponse),
    /// Pull request for all records under a path prefix.
    AntiEntropyRequest(AntiEntropyRequest),
    /// One batch of records answering a pull request.
    AntiEntropyResponse(AntiEntropyResponse),
    /// Key-possession challenge sent on connect.
    SecurityHandshake(Handshake),
    /// Answer to a key-possession challenge.
    SecurityHandshakeResponse(HandshakeResponse),
    /// Initial identity announcement.
    Identify(Identify),
}

impl PeerEvent {
    /// The wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            PeerEvent::Put(_) => "put",
            PeerEvent::VectorClockSync(_) => "vector-clock-sync",
            PeerEvent::VectorClockSyncResponse(_) => "vector-clock-sync-response",
            PeerEvent::AntiEntropyRequest(_) => "anti-entropy-request",
            PeerEvent::AntiEntropyResponse(_) => "anti-entropy-response",
            PeerEvent::SecurityHandshake(_) => "security-handshake",
            PeerEvent::SecurityHandshakeResponse(_) => "security-handshake-response",
            PeerEvent::Identify(_) => "identify",
        }
    }

    /// True for anti-entropy traffic, which is exempt from rate limiting.
    pub fn is_anti_entropy(&self) -> bool {
        match self {
            PeerEvent::Put(msg) => msg.anti_entropy,
            PeerEvent::VectorClockSync(msg) => msg.is_anti_entropy,
            PeerEvent::VectorClockSyncResponse(msg) => msg.is_anti_entropy,
            PeerEvent::AntiEntropyRequest(msg) => msg.is_anti_entropy,
            PeerEvent::AntiEntropyResponse(msg) => msg.is_anti_entropy,
            _ => false,
        }
    }
}

/// A write travelling through the mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutMessage {
    /// The path being written.
    pub path: String,
    /// The new value (`null` for deletions).
    pub value: JsonValue,
    /// Random 128-bit message id; the authoritative dedupe key.
    pub msg_id: String,
    /// NodeId that authored the write.
    pub origin: String,
    /// The author's clock at send time. Absent clocks are treated as a
    /// singleton `{origin: 1}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_clock: Option<VectorClock>,
    /// Nodes this message has already passed through; best-effort loop
    /// prevention on top of the `msg_id` dedupe.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub visited_servers: Vec<String>,
    /// Hop counter, observability only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop_count: Option<u32>,
    /// True when re-broadcast by a relay rather than the origin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded: Option<bool>,
    /// Set on writes fed back by the anti-entropy loop; suppresses
    /// re-broadcast.
    #[serde(default)]
    pub anti_entropy: bool,
}

impl PutMessage {
    /// Build a freshly authored local write.
    pub fn local(
        path: impl Into<String>,
        value: JsonValue,
        msg_id: String,
        origin: impl Into<String>,
        vector_clock: VectorClock,
    ) -> Self {
        Self {
            path: path.into(),
            value,
            msg_id,
            origin: origin.into(),
            vector_clock: Some(vector_clock),
            visited_servers: Vec::new(),
            hop_count: None,
            forwarded: None,
            anti_entropy: false,
        }
    }
}

/// Vector clock push.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockSync {
    /// The sender's clock.
    pub vector_clock: VectorClock,
    /// The sender.
    pub node_id: String,
    /// Observability only.
    pub timestamp: DateTime<Utc>,
    /// Correlates the response.
    pub sync_id: String,
    /// Rate-limit exemption marker.
    pub is_anti_entropy: bool,
}

/// Merged clock answering a push.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockSyncResponse {
    /// The responder's clock after merging the push.
    pub vector_clock: VectorClock,
    /// The responder.
    pub node_id: String,
    /// Observability only.
    pub timestamp: DateTime<Utc>,
    /// The `sync_id` this responds to.
    pub in_response_to: String,
    /// Rate-limit exemption marker.
    pub is_anti_entropy: bool,
}

/// Pull request for a path prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AntiEntropyRequest {
    /// Correlates the response batches.
    pub request_id: String,
    /// The requester.
    pub node_id: String,
    /// The requester's clock, merged by the responder.
    pub vector_clock: VectorClock,
    /// Observability only.
    pub timestamp: DateTime<Utc>,
    /// Path prefix to reconcile; empty means everything.
    pub path: String,
    /// Always true.
    pub is_anti_entropy: bool,
}

/// One record inside an anti-entropy response batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// The record's path.
    pub path: String,
    /// The record's value (`null` for tombstones).
    pub value: JsonValue,
    /// The record's clock.
    pub vector_clock: VectorClock,
    /// The record's author.
    pub origin: String,
    /// Observability only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// One batch of records answering a pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AntiEntropyResponse {
    /// Shared by all batches of one response.
    pub response_id: String,
    /// The responder.
    pub node_id: String,
    /// The responder's clock after merging the request's.
    pub vector_clock: VectorClock,
    /// Observability only.
    pub timestamp: DateTime<Utc>,
    /// Zero-based index of this batch.
    pub batch_index: usize,
    /// Total number of batches in this response.
    pub total_batches: usize,
    /// The records in this batch.
    pub changes: Vec<Change>,
    /// Always true.
    pub is_anti_entropy: bool,
}

/// Key-possession challenge: a random token sealed with the sender's key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    /// The sealed challenge token.
    pub challenge: CipherEnvelope,
}

/// Answer to a handshake challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    /// Whether the responder could open the challenge.
    pub success: bool,
    /// The responder's id.
    #[serde(rename = "serverID", default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Observability only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// The decrypted challenge token, echoed back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_challenge: Option<String>,
    /// HMAC over the echoed token, proving key possession.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Whether the responder runs with encryption enabled.
    pub security_enabled: bool,
    /// Optional failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Initial identity announcement on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identify {
    /// The announcing node.
    #[serde(rename = "serverID")]
    pub server_id: String,
    /// Transport endpoint the node can be reached at.
    pub url: String,
}
