//! Persisted shape of a forest and its on-disk store.
//!
//! The forest is written as a single JSON document. Writes go to a temp file
//! that is renamed over the target, so a crash never leaves a torn snapshot.

use canopy_core::error::StorageError;
use canopy_core::message::{Message, NodeId, Timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One node as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub title: String,
    #[serde(default)]
    pub parent_id: Option<NodeId>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_turns: Option<usize>,
}

/// A node's buffer contents as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferRecord {
    pub node_id: NodeId,
    pub messages: Vec<Message>,
}

/// Everything needed to rehydrate a forest.
///
/// Nodes are listed parents-before-children.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForestSnapshot {
    pub nodes: Vec<NodeRecord>,
    pub buffers: Vec<BufferRecord>,
    /// Last issued timestamp
    #[serde(default)]
    pub clock: Timestamp,
    /// Messages whose indexing was deferred and has not succeeded yet.
    /// They may no longer be buffered.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<Message>,
}

/// Reads and writes a [`ForestSnapshot`] at a fixed path.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot, or `None` if nothing was saved yet.
    pub fn load(&self) -> Result<Option<ForestSnapshot>, StorageError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::Io(format!(
                    "Failed to read {}: {e}",
                    self.path.display()
                )));
            }
        };
        let snapshot: ForestSnapshot = serde_json::from_str(&content).map_err(|e| {
            StorageError::Corrupt(format!("{}: {e}", self.path.display()))
        })?;
        debug!(
            path = %self.path.display(),
            nodes = snapshot.nodes.len(),
            "Forest snapshot loaded"
        );
        Ok(Some(snapshot))
    }

    /// Write the snapshot atomically.
    pub fn save(&self, snapshot: &ForestSnapshot) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| StorageError::Io(format!("Failed to serialize forest: {e}")))?;
        write_atomic(&self.path, &bytes)?;
        debug!(
            path = %self.path.display(),
            nodes = snapshot.nodes.len(),
            "Forest snapshot saved"
        );
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let io = |what: &str, e: std::io::Error| StorageError::Io(format!("{what}: {e}"));

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| io("Failed to create data directory", e))?;
        }
    }
    let tmp = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp).map_err(|e| io("Failed to open temp file", e))?;
        f.write_all(bytes).map_err(|e| io("Failed to write temp file", e))?;
        f.flush().map_err(|e| io("Failed to flush temp file", e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| io("Failed to replace snapshot", e))?;
    Ok(())
}
