/// Error types for meshkv operations.
///
/// This module provides the error hierarchy covering all failure modes in the
/// replication engine. All errors are well-typed and can be pattern-matched
/// for precise error handling.
///
/// The policy is to isolate the replication loop from peer misbehavior: no
/// inbound message may crash a node. Handlers catch `Decrypt` and `Protocol`
/// errors, log them, and drop the offending message. Local API errors
/// propagate to the caller unchanged.
use thiserror::Error;

/// The main error type for meshkv operations.
///
/// All fallible operations in meshkv return `Result<T, MeshError>`.
#[derive(Error, Debug)]
pub enum MeshError {
    /// Invalid configuration detected at construction. Fatal.
    #[error("Invalid configuration: {reason}")]
    Config {
        /// Description of the invalid option.
        reason: String,
    },

    /// Operation attempted after `close` started.
    #[error("Node is shutting down")]
    ShuttingDown,

    /// An envelope failed verification (wrong key or tampering).
    /// The offending message is dropped; the node keeps running.
    #[error("Envelope verification failed: {0}")]
    Decrypt(String),

    /// Underlying store failure.
    #[error("Storage error: {0}")]
    Store(String),

    /// A custom conflict resolver failed. The write pipeline falls back
    /// to vector-dominance resolution when it sees this.
    #[error("Conflict resolver failed: {0}")]
    Resolver(String),

    /// Malformed or missing required fields in a wire message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport failure while emitting to a peer.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization error when converting data to/from JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MeshError {
    /// Construct a `Config` error from any printable reason.
    pub fn config(reason: impl Into<String>) -> Self {
        MeshError::Config {
            reason: reason.into(),
        }
    }
}

/// Result type alias for meshkv operations.
pub type MeshResult<T> = Result<T, MeshError>;
