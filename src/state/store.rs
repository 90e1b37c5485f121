//! Snapshot stores.
//!
//! `SnapshotStore` is the persistence seam of the orchestrator. Two stores
//! ship with the crate: an in-memory store for tests and embedding, and a
//! JSON file store that keeps the latest snapshot per instance plus an
//! append-only log of every snapshot written.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::instance::checkpoint::InstanceId;
use crate::state::snapshot::Snapshot;
use crate::{Error, Result};

/// Saves and loads snapshots by instance id.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;

    /// Latest snapshot of `instance`, if any.
    async fn load(&self, instance: &InstanceId) -> Result<Option<Snapshot>>;
}

/// Keeps every snapshot in memory.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<InstanceId, Vec<Snapshot>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, HashMap<InstanceId, Vec<Snapshot>>> {
        self.snapshots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of snapshots saved for `instance`.
    pub fn saved(&self, instance: &InstanceId) -> usize {
        self.inner().get(instance).map(Vec::len).unwrap_or(0)
    }

    /// Every snapshot saved for `instance`, oldest first.
    pub fn all(&self, instance: &InstanceId) -> Vec<Snapshot> {
        self.inner().get(instance).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        self.inner()
            .entry(snapshot.instance_id().clone())
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn load(&self, instance: &InstanceId) -> Result<Option<Snapshot>> {
        Ok(self.inner().get(instance).and_then(|all| all.last().cloned()))
    }
}

/// On-disk wrapper recording when a snapshot was written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    pub saved_at: DateTime<Utc>,
    pub snapshot: Snapshot,
}

/// Stores snapshots as JSON files under one directory.
///
/// - `<instance>.json`: latest snapshot, replaced atomically
/// - `<instance>_history.jsonl`: one line per snapshot ever saved
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_stem(instance: &InstanceId) -> Result<&str> {
        let id = instance.as_str();
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !id.starts_with('.');
        if valid {
            Ok(id)
        } else {
            Err(Error::Persistence(format!("invalid instance id for file store: {:?}", id)))
        }
    }

    pub fn latest_path(&self, instance: &InstanceId) -> Result<PathBuf> {
        Ok(self.dir.join(format!("{}.json", Self::file_stem(instance)?)))
    }

    pub fn log_path(&self, instance: &InstanceId) -> Result<PathBuf> {
        Ok(self.dir.join(format!("{}_history.jsonl", Self::file_stem(instance)?)))
    }

    /// Every snapshot written for `instance`, oldest first.
    pub async fn history(&self, instance: &InstanceId) -> Result<Vec<SnapshotEnvelope>> {
        let path = self.log_path(instance)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }
        let contents = tokio::fs::read_to_string(&path).await?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Error::from))
            .collect()
    }

    /// Instance ids that have a latest snapshot in the directory.
    pub async fn instances(&self) -> Result<Vec<InstanceId>> {
        if !tokio::fs::try_exists(&self.dir).await? {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(".json") {
                ids.push(InstanceId::new(stem));
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let instance = snapshot.instance_id();
        let latest = self.latest_path(instance)?;
        let log = self.log_path(instance)?;
        tracing::debug!(path = %latest.display(), sequence = snapshot.sequence, "Saving snapshot");

        tokio::fs::create_dir_all(&self.dir).await?;

        let envelope = SnapshotEnvelope {
            saved_at: Utc::now(),
            snapshot: snapshot.clone(),
        };
        let pretty = serde_json::to_string_pretty(&envelope)?;
        let temp = latest.with_extension("json.tmp");
        tokio::fs::write(&temp, pretty).await?;
        tokio::fs::rename(&temp, &latest).await?;

        let mut line = serde_json::to_string(&envelope)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        tracing::debug!(path = %latest.display(), "Snapshot saved");
        Ok(())
    }

    async fn load(&self, instance: &InstanceId) -> Result<Option<Snapshot>> {
        let path = self.latest_path(instance)?;
        if !tokio::fs::try_exists(&path).await? {
            tracing::debug!(path = %path.display(), "No snapshot found");
            return Ok(None);
        }
        let contents = tokio::fs::read_to_string(&path).await?;
        let envelope: SnapshotEnvelope = serde_json::from_str(&contents)
            .map_err(|e| Error::Persistence(format!("corrupt snapshot {}: {}", path.display(), e)))?;
        tracing::debug!(
            path = %path.display(),
            sequence = envelope.snapshot.sequence,
            "Snapshot loaded"
        );
        Ok(Some(envelope.snapshot))
    }
}
