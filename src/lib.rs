//! # meshkv
//!
//! An eventually-consistent, peer-to-peer replicated key-value store with
//! hierarchical path-shaped keys.
//!
//! Each node holds a full local replica on durable storage, accepts local
//! reads and writes, and gossips updates to a mesh of peers over a
//! confidential, authenticated transport. Convergence under concurrent
//! writes, node restarts, transient partitions, and message loss is
//! guaranteed by a vector-clock causality layer together with pluggable
//! conflict resolution and a pull-based anti-entropy protocol.
//!
//! ## Quick Start
//!
//! ```ignore
//! use meshkv::{MemoryHub, MemoryStore, NodeConfig, ReplicationNode};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = MemoryHub::new();
//!     let (transport, inbound) = hub.attach("n1");
//!
//!     let config = NodeConfig::new("n1").master_key("a-shared-secret-of-16+");
//!     let node = ReplicationNode::new(
//!         config,
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(transport),
//!         inbound,
//!     )?;
//!     node.start().await?;
//!
//!     node.put("app/user/alice", json!({"name": "Alice"})).await?;
//!     let user = node.get("app/user/alice").await?;
//!     println!("user: {:?}", user);
//!
//!     node.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! A local write enters [`ReplicationNode`] and flows through the write
//! pipeline: dedupe, conflict resolution against the stored record, clock
//! stamping, persistence, subscriber notification, and broadcast through
//! the encryption envelope. A remote write arrives through the transport,
//! is unwrapped by the envelope, and runs the same pipeline minus the
//! re-broadcast when it was delivered by anti-entropy.
//!
//! Causality is carried purely by vector clocks; wall-clock timestamps
//! travel in messages for observability only. Nodes holding a different
//! master key fail envelope verification on every message and silently
//! fail to converge, which isolates clusters from each other.
//!
//! ## Thread Safety
//!
//! All node operations are thread-safe. Sub-managers share the node's
//! guarded state rather than process globals, so one address space can
//! host many nodes (the test suite runs whole clusters in one process).

pub mod anti_entropy;
pub mod clock;
pub mod config;
pub mod envelope;
pub mod error;
pub mod node;
pub mod protocol;
pub mod resolver;
pub mod store;
pub mod subscriptions;
pub mod transport;
pub mod types;
pub mod versions;
pub mod writer;

// Public API exports
pub use anti_entropy::{AntiEntropy, AntiEntropyStatus};
pub use clock::{ClockRelation, VectorClock};
pub use config::{ConflictConfig, NodeConfig, SecurityConfig, SyncConfig};
pub use envelope::{CipherEnvelope, Payload, SecurityEnvelope};
pub use error::{MeshError, MeshResult};
pub use node::{NodeStatus, ReplicationNode};
pub use protocol::{PeerEvent, PutMessage};
pub use resolver::{ConflictResolver, ConflictStrategy, ResolveConflict};
pub use store::{FileStore, KvStore, MemoryStore};
pub use subscriptions::{SubscriptionBus, SubscriptionId, SubscriptionInfo};
pub use transport::{InboundMessage, MemoryHub, MemoryTransport, Transport};
pub use types::{PutReceipt, Record, ScanEntry};
pub use versions::VersionStore;
pub use writer::WriteProcessor;

// Re-export commonly used external types for convenience
pub use serde_json::{json, Value as JsonValue};

/// Initialize the logging system.
///
/// This should be called once at application startup. The log level is
/// controlled via the `MESHKV_LOG` environment variable:
/// - `MESHKV_LOG=error` - Only errors
/// - `MESHKV_LOG=warn` - Errors and warnings
/// - `MESHKV_LOG=info` - General information (default)
/// - `MESHKV_LOG=debug` - Debug information
/// - `MESHKV_LOG=trace` - Verbose tracing
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("MESHKV_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Initialize logging with a specific level.
pub fn init_logging_with_level(level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::registry()
        .with(EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
