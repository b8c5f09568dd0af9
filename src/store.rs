/// Durable storage for replicated records.
///
/// The replication engine consumes storage only through the `KvStore` trait:
/// an ordered key-value collaborator with `get`, `put`, `del`, `scan`, and
/// `close`. Records are persisted as `{value, vectorClock, origin}` triples
/// keyed by path; a record with `value == null` is a tombstone and a valid
/// persisted state.
///
/// Two implementations ship with the crate:
///
/// - [`MemoryStore`]: DashMap-backed, for tests and ephemeral replicas.
/// - [`FileStore`]: newline-delimited-JSON append log with snapshot
///   compaction, replayed on open. One directory per replica.
use crate::error::{MeshError, MeshResult};
use crate::types::{is_ancestor_or_equal, Record};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::warn;

/// The durable ordered key-value collaborator.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Load the record at a path. Absent paths are `None`, not an error.
    async fn get(&self, path: &str) -> MeshResult<Option<Record>>;

    /// Persist a record at a path, replacing any previous record.
    async fn put(&self, path: &str, record: Record) -> MeshResult<()>;

    /// Physically remove a path. Returns whether it existed.
    ///
    /// Replication soft-deletes by writing tombstones; this is for wiping.
    async fn del(&self, path: &str) -> MeshResult<bool>;

    /// All records under a prefix, ordered by path. The empty prefix scans
    /// everything.
    async fn scan(&self, prefix: &str) -> MeshResult<Vec<(String, Record)>>;

    /// Flush and release resources.
    async fn close(&self) -> MeshResult<()>;
}

/// In-memory store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, Record>,
}

impl MemoryStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, path: &str) -> MeshResult<Option<Record>> {
        Ok(self.records.get(path).map(|r| r.clone()))
    }

    async fn put(&self, path: &str, record: Record) -> MeshResult<()> {
        self.records.insert(path.to_string(), record);
        Ok(())
    }

    async fn del(&self, path: &str) -> MeshResult<bool> {
        Ok(self.records.remove(path).is_some())
    }

    async fn scan(&self, prefix: &str) -> MeshResult<Vec<(String, Record)>> {
        let mut entries: Vec<(String, Record)> = self
            .records
            .iter()
            .filter(|entry| is_ancestor_or_equal(prefix, entry.key()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    async fn close(&self) -> MeshResult<()> {
        Ok(())
    }
}

/// One entry in the append log.
#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    /// Operation type: "put" or "del".
    op: String,
    /// The path written.
    path: String,
    /// The record, present for puts.
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<Record>,
}

/// File-backed store: an append-only JSON-line log plus a snapshot.
///
/// # Storage layout
///
/// ```text
/// <dir>/
/// ├── snapshot.json    # one {path, record} JSON line per record
/// └── wal.log          # JSON-line entries appended since the snapshot
/// ```
///
/// On open, the snapshot is loaded and the log replayed over it. `close`
/// compacts: the full state is written to a temporary snapshot, atomically
/// renamed into place, and the log truncated. Corrupt log lines (torn
/// writes) are logged and skipped during replay.
pub struct FileStore {
    dir: PathBuf,
    records: DashMap<String, Record>,
    wal: Mutex<fs::File>,
}

impl FileStore {
    /// Open (or create) a store in the given directory and replay its log.
    pub async fn open(dir: impl AsRef<Path>) -> MeshResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| MeshError::Store(format!("create {}: {}", dir.display(), e)))?;

        let records = DashMap::new();
        Self::load_snapshot(&dir.join("snapshot.json"), &records).await?;
        Self::replay_wal(&dir.join("wal.log"), &records).await?;

        let wal = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("wal.log"))
            .await
            .map_err(|e| MeshError::Store(format!("open wal: {}", e)))?;

        Ok(Self {
            dir,
            records,
            wal: Mutex::new(wal),
        })
    }

    async fn load_snapshot(path: &Path, records: &DashMap<String, Record>) -> MeshResult<()> {
        let file = match fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(MeshError::Store(format!("open snapshot: {}", e))),
        };
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| MeshError::Store(format!("read snapshot: {}", e)))?
        {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) => {
                    if let Some(record) = entry.record {
                        records.insert(entry.path, record);
                    }
                }
                Err(e) => warn!(error = %e, "skipping corrupt snapshot line"),
            }
        }
        Ok(())
    }

    async fn replay_wal(path: &Path, records: &DashMap<String, Record>) -> MeshResult<()> {
        let file = match fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(MeshError::Store(format!("open wal: {}", e))),
        };
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| MeshError::Store(format!("read wal: {}", e)))?
        {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) => match (entry.op.as_str(), entry.record) {
                    ("put", Some(record)) => {
                        records.insert(entry.path, record);
                    }
                    ("del", _) => {
                        records.remove(&entry.path);
                    }
                    _ => warn!(op = %entry.op, "skipping malformed wal entry"),
                },
                Err(e) => warn!(error = %e, "skipping corrupt wal line"),
            }
        }
        Ok(())
    }

    async fn append(&self, entry: &LogEntry) -> MeshResult<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut wal = self.wal.lock().await;
        wal.write_all(&line)
            .await
            .map_err(|e| MeshError::Store(format!("append wal: {}", e)))?;
        wal.flush()
            .await
            .map_err(|e| MeshError::Store(format!("flush wal: {}", e)))?;
        Ok(())
    }

    /// Fold the log into a fresh snapshot and truncate the log.
    pub async fn compact(&self) -> MeshResult<()> {
        let tmp_path = self.dir.join("snapshot.tmp");
        let mut tmp = fs::File::create(&tmp_path)
            .await
            .map_err(|e| MeshError::Store(format!("create snapshot: {}", e)))?;

        let mut entries: Vec<(String, Record)> = self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (path, record) in entries {
            let mut line = serde_json::to_vec(&LogEntry {
                op: "put".to_string(),
                path,
                record: Some(record),
            })?;
            line.push(b'\n');
            tmp.write_all(&line)
                .await
                .map_err(|e| MeshError::Store(format!("write snapshot: {}", e)))?;
        }
        tmp.flush()
            .await
            .map_err(|e| MeshError::Store(format!("flush snapshot: {}", e)))?;
        drop(tmp);

        fs::rename(&tmp_path, self.dir.join("snapshot.json"))
            .await
            .map_err(|e| MeshError::Store(format!("publish snapshot: {}", e)))?;

        // The snapshot now owns all state; restart the log.
        let mut wal = self.wal.lock().await;
        *wal = fs::File::create(self.dir.join("wal.log"))
            .await
            .map_err(|e| MeshError::Store(format!("truncate wal: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, path: &str) -> MeshResult<Option<Record>> {
        Ok(self.records.get(path).map(|r| r.clone()))
    }

    async fn put(&self, path: &str, record: Record) -> MeshResult<()> {
        self.append(&LogEntry {
            op: "put".to_string(),
            path: path.to_string(),
            record: Some(record.clone()),
        })
        .await?;
        self.records.insert(path.to_string(), record);
        Ok(())
    }

    async fn del(&self, path: &str) -> MeshResult<bool> {
        self.append(&LogEntry {
            op: "del".to_string(),
            path: path.to_string(),
            record: None,
        })
        .await?;
        Ok(self.records.remove(path).is_some())
    }

    async fn scan(&self, prefix: &str) -> MeshResult<Vec<(String, Record)>> {
        let mut entries: Vec<(String, Record)> = self
            .records
            .iter()
            .filter(|entry| is_ancestor_or_equal(prefix, entry.key()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    async fn close(&self) -> MeshResult<()> {
        self.compact().await
    }
}
