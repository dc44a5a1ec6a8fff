//! File-based vector store: persistent JSON-lines storage.
//!
//! Each line is a JSON-encoded `VectorEntry`
//! (`{message_id, node_id, role, timestamp, embedding, text}`).
//! Inserts append a single line; only teardown operations rewrite the file.
//!
//! Storage location: `<data_dir>/vectors.jsonl`

use async_trait::async_trait;
use canopy_core::error::StorageError;
use canopy_core::memory::{ScoredEntry, VectorEntry, VectorQuery, VectorStore};
use canopy_core::message::{MessageId, NodeId};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::in_memory::{Entries, search_snapshot};

/// A file-backed vector store using JSONL (one JSON object per line).
///
/// Entries are loaded into memory on creation. Searches never touch disk.
pub struct FileVectorStore {
    path: PathBuf,
    entries: RwLock<Entries>,
}

impl FileVectorStore {
    /// Open the store at `path`.
    ///
    /// If the file exists, entries are loaded from it, skipping lines that do
    /// not parse. If it does not exist, starts empty (file created on first
    /// write).
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let mut entries = Entries::default();
        for entry in Self::load_from_disk(&path)? {
            entries.push(entry);
        }
        debug!(path = %path.display(), count = entries.items.len(), "Vector file loaded");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_from_disk(path: &Path) -> Result<Vec<VectorEntry>, StorageError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StorageError::Io(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        Ok(content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(n, line)| match serde_json::from_str::<VectorEntry>(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(line = n + 1, error = %e, "Skipping corrupted vector entry");
                    None
                }
            })
            .collect())
    }

    fn ensure_parent(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Io(format!("Failed to create vector directory: {e}"))
                })?;
            }
        }
        Ok(())
    }

    fn encode(entry: &VectorEntry) -> Result<String, StorageError> {
        serde_json::to_string(entry)
            .map_err(|e| StorageError::Io(format!("Failed to serialize vector entry: {e}")))
    }

    /// Append one line. The caller holds the write lock.
    fn append_line(&self, entry: &VectorEntry) -> Result<(), StorageError> {
        self.ensure_parent()?;
        let mut line = Self::encode(entry)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StorageError::Unavailable(format!("Failed to open vector file: {e}")))?;
        file.write_all(line.as_bytes())
            .map_err(|e| StorageError::Io(format!("Failed to append vector entry: {e}")))
    }

    /// Rewrite the whole file. The caller holds the write lock.
    fn rewrite(&self, entries: &Entries) -> Result<(), StorageError> {
        self.ensure_parent()?;
        let mut content = String::new();
        for entry in &entries.items {
            content.push_str(&Self::encode(entry)?);
            content.push('\n');
        }
        std::fs::write(&self.path, &content)
            .map_err(|e| StorageError::Io(format!("Failed to write vector file: {e}")))
    }
}

#[async_trait]
impl VectorStore for FileVectorStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn insert(&self, entry: VectorEntry) -> Result<(), StorageError> {
        let mut entries = self.entries.write().await;
        if entries.ids.contains(&entry.message_id) {
            return Ok(());
        }
        // Disk first, so a failed write leaves memory and file in agreement
        self.append_line(&entry)?;
        entries.push(entry);
        Ok(())
    }

    async fn search(&self, query: &VectorQuery) -> Result<Vec<ScoredEntry>, StorageError> {
        Ok(search_snapshot(&self.entries, query).await)
    }

    async fn contains(&self, message_id: &MessageId) -> Result<bool, StorageError> {
        Ok(self.entries.read().await.ids.contains(message_id))
    }

    async fn count(&self) -> Result<usize, StorageError> {
        Ok(self.entries.read().await.items.len())
    }

    async fn remove_nodes(&self, nodes: &HashSet<NodeId>) -> Result<usize, StorageError> {
        let mut entries = self.entries.write().await;
        let removed = entries.remove_nodes(nodes);
        if removed > 0 {
            self.rewrite(&entries)?;
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut entries = self.entries.write().await;
        *entries = Entries::default();
        self.rewrite(&entries)
    }
}
