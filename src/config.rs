/// Node configuration and validation.
///
/// A `NodeConfig` is assembled with builder-style setters and validated once
/// at node construction; invalid options are fatal and surface to the caller
/// as `MeshError::Config`. Custom conflict resolver functions are registered
/// at runtime on the node rather than carried here, keeping the config plain
/// data.
use crate::error::{MeshError, MeshResult};
use crate::resolver::ConflictStrategy;
use crate::versions::DEFAULT_MAX_VERSIONS;
use std::collections::HashMap;
use std::time::Duration;

/// Security (envelope) configuration.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Whether peer messages are wrapped in authenticated encryption.
    pub enabled: bool,
    /// Pre-shared master key, identical on every node of the cluster.
    /// Required when `enabled`; minimum 16 characters.
    pub master_key: Option<String>,
    /// Cipher suite identifier.
    pub algorithm: String,
    /// PBKDF2 iteration count for per-message key derivation.
    pub kdf_iterations: u32,
    /// Derived key length in bytes.
    pub key_length: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            master_key: None,
            algorithm: crate::envelope::AES_256_GCM.to_string(),
            kdf_iterations: 10_000,
            key_length: 32,
        }
    }
}

/// Synchronization tuning.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Interval between periodic anti-entropy runs; `None` disables the
    /// periodic loop (manual `run_anti_entropy` still works).
    pub anti_entropy_interval: Option<Duration>,
    /// How long processed message ids are remembered for deduplication.
    pub max_message_age: Duration,
    /// Bound on the per-path version history.
    pub max_versions: usize,
    /// Interval of the lightweight vector-clock exchange with peers.
    pub clock_sync_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            anti_entropy_interval: None,
            max_message_age: Duration::from_secs(300),
            max_versions: DEFAULT_MAX_VERSIONS,
            clock_sync_interval: Duration::from_secs(2),
        }
    }
}

/// Conflict resolution configuration.
#[derive(Debug, Clone, Default)]
pub struct ConflictConfig {
    /// Strategy applied when no path rule matches.
    pub default_strategy: ConflictStrategy,
    /// Path prefix → strategy overrides.
    pub path_strategies: HashMap<String, ConflictStrategy>,
}

/// Configuration for a replication node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable node identity. Short opaque string, chosen at creation.
    pub server_id: String,
    /// Transport endpoints of the initial peer set.
    pub peers: Vec<String>,
    /// Envelope settings.
    pub security: SecurityConfig,
    /// Synchronization settings.
    pub sync: SyncConfig,
    /// Conflict resolution settings.
    pub conflict: ConflictConfig,
}

impl NodeConfig {
    /// Create a config with the given node identity and defaults elsewhere.
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            peers: Vec::new(),
            security: SecurityConfig::default(),
            sync: SyncConfig::default(),
            conflict: ConflictConfig::default(),
        }
    }

    /// Set the initial peer set.
    pub fn peers(mut self, peers: Vec<String>) -> Self {
        self.peers = peers;
        self
    }

    /// Enable encryption with the given pre-shared master key.
    pub fn master_key(mut self, key: impl Into<String>) -> Self {
        self.security.enabled = true;
        self.security.master_key = Some(key.into());
        self
    }

    /// Disable the encryption envelope entirely.
    pub fn insecure(mut self) -> Self {
        self.security.enabled = false;
        self.security.master_key = None;
        self
    }

    /// Set the periodic anti-entropy interval.
    pub fn anti_entropy_interval(mut self, interval: Option<Duration>) -> Self {
        self.sync.anti_entropy_interval = interval;
        self
    }

    /// Set the message-id retention window.
    pub fn max_message_age(mut self, age: Duration) -> Self {
        self.sync.max_message_age = age;
        self
    }

    /// Set the per-path version history bound.
    pub fn max_versions(mut self, max: usize) -> Self {
        self.sync.max_versions = max;
        self
    }

    /// Set the default conflict strategy.
    pub fn default_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict.default_strategy = strategy;
        self
    }

    /// Add a path-scoped conflict strategy rule.
    pub fn path_strategy(mut self, prefix: impl Into<String>, strategy: ConflictStrategy) -> Self {
        self.conflict.path_strategies.insert(prefix.into(), strategy);
        self
    }

    /// Validate the configuration. Called once at node construction.
    pub fn validate(&self) -> MeshResult<()> {
        if self.server_id.is_empty() {
            return Err(MeshError::config("server_id must not be empty"));
        }
        if self.security.enabled {
            match &self.security.master_key {
                None => {
                    return Err(MeshError::config(
                        "security.master_key is required when security is enabled",
                    ))
                }
                Some(key) if key.len() < 16 => {
                    return Err(MeshError::config(
                        "security.master_key must be at least 16 characters",
                    ))
                }
                Some(_) => {}
            }
            if self.security.algorithm != crate::envelope::AES_256_GCM {
                return Err(MeshError::config(format!(
                    "unsupported security.algorithm '{}'",
                    self.security.algorithm
                )));
            }
            if self.security.kdf_iterations < 1000 {
                return Err(MeshError::config(
                    "security.kdf_iterations must be at least 1000",
                ));
            }
            if self.security.key_length < 16 {
                return Err(MeshError::config(
                    "security.key_length must be at least 16 bytes",
                ));
            }
        }
        if let Some(interval) = self.sync.anti_entropy_interval {
            if interval < Duration::from_secs(1) {
                return Err(MeshError::config(
                    "sync.anti_entropy_interval must be at least 1s",
                ));
            }
        }
        if self.sync.max_message_age < Duration::from_secs(1) {
            return Err(MeshError::config("sync.max_message_age must be at least 1s"));
        }
        if self.sync.max_versions < 1 {
            return Err(MeshError::config("sync.max_versions must be at least 1"));
        }
        Ok(())
    }
}
