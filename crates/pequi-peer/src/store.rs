//! Node liveness stores
//!
//! The liveness store is the one piece of state mutated directly by every
//! peer outside the object substrate. All writes are idempotent upserts
//! keyed by node name, so concurrent writers cannot corrupt it. It is
//! consulted only for peer bootstrap and heartbeat; it is not a data store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{info, warn};

use pequi_api::model::NodeRecord;
use pequi_common::PequiError;

/// A keyed store of node records supporting idempotent upsert, partial
/// update of the heartbeat fields, and filtered read-all
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Inserts or replaces the record for its node name
    async fn upsert(&self, record: NodeRecord) -> Result<(), PequiError>;

    /// Refreshes the last-updated stamp of a record.
    ///
    /// Returns `false` when no record exists under that name.
    async fn heartbeat(&self, node_name: &str, now: i64) -> Result<bool, PequiError>;

    /// Flags a record as explicitly shut down
    async fn mark_shutdown(&self, node_name: &str) -> Result<(), PequiError>;

    /// Every record currently in the store
    async fn load_all(&self) -> Result<Vec<NodeRecord>, PequiError>;

    /// Records that are live at `now`: refreshed within the window and not
    /// shut down
    async fn live_nodes(&self, now: i64, window_ms: u64) -> Result<Vec<NodeRecord>, PequiError> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|record| record.is_live(now, window_ms))
            .collect())
    }
}

/// In-memory node store for embedding and tests
#[derive(Default)]
pub struct MemoryNodeStore {
    records: DashMap<String, NodeRecord>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn upsert(&self, record: NodeRecord) -> Result<(), PequiError> {
        self.records.insert(record.node_name.clone(), record);
        Ok(())
    }

    async fn heartbeat(&self, node_name: &str, now: i64) -> Result<bool, PequiError> {
        match self.records.get_mut(node_name) {
            Some(mut record) => {
                record.last_updated = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_shutdown(&self, node_name: &str) -> Result<(), PequiError> {
        if let Some(mut record) = self.records.get_mut(node_name) {
            record.shutdown = true;
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<NodeRecord>, PequiError> {
        Ok(self.records.iter().map(|e| e.value().clone()).collect())
    }
}

/// File-backed node store: one JSON file per node under a shared directory.
///
/// Every write is a whole-file replace, which keeps upserts idempotent when
/// several peers share the directory over a common mount.
pub struct FileNodeStore {
    dir: PathBuf,
}

impl FileNodeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PequiError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "file node store ready");
        Ok(Self { dir })
    }

    fn record_path(&self, node_name: &str) -> Result<PathBuf, PequiError> {
        if node_name.is_empty()
            || node_name
                .chars()
                .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
        {
            return Err(PequiError::IllegalArgument(format!(
                "invalid node name '{}'",
                node_name
            )));
        }
        Ok(self.dir.join(format!("{}.json", node_name)))
    }

    fn read_record(path: &Path) -> Result<NodeRecord, PequiError> {
        let raw = std::fs::read(path)?;
        serde_json::from_slice(&raw).map_err(|e| PequiError::StoreError(e.to_string()))
    }

    fn write_record(&self, record: &NodeRecord) -> Result<(), PequiError> {
        let path = self.record_path(&record.node_name)?;
        let raw = serde_json::to_vec_pretty(record)
            .map_err(|e| PequiError::StoreError(e.to_string()))?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}

#[async_trait]
impl NodeStore for FileNodeStore {
    async fn upsert(&self, record: NodeRecord) -> Result<(), PequiError> {
        self.write_record(&record)
    }

    async fn heartbeat(&self, node_name: &str, now: i64) -> Result<bool, PequiError> {
        let path = self.record_path(node_name)?;
        if !path.exists() {
            return Ok(false);
        }
        let mut record = Self::read_record(&path)?;
        record.last_updated = now;
        self.write_record(&record)?;
        Ok(true)
    }

    async fn mark_shutdown(&self, node_name: &str) -> Result<(), PequiError> {
        let path = self.record_path(node_name)?;
        if !path.exists() {
            return Ok(());
        }
        let mut record = Self::read_record(&path)?;
        record.shutdown = true;
        self.write_record(&record)
    }

    async fn load_all(&self) -> Result<Vec<NodeRecord>, PequiError> {
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable node record");
                }
            }
        }
        Ok(records)
    }
}
