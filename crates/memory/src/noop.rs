//! No-op vector store: disables long-range recall entirely.

use async_trait::async_trait;
use canopy_core::error::StorageError;
use canopy_core::memory::{ScoredEntry, VectorEntry, VectorQuery, VectorStore};
use canopy_core::message::{MessageId, NodeId};
use std::collections::HashSet;

/// A vector store that stores nothing and finds nothing.
pub struct NoopVectorStore;

#[async_trait]
impl VectorStore for NoopVectorStore {
    fn name(&self) -> &str { "none" }

    async fn insert(&self, _entry: VectorEntry) -> Result<(), StorageError> {
        Ok(())
    }

    async fn search(&self, _query: &VectorQuery) -> Result<Vec<ScoredEntry>, StorageError> {
        Ok(Vec::new())
    }

    async fn contains(&self, _message_id: &MessageId) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn count(&self) -> Result<usize, StorageError> {
        Ok(0)
    }

    async fn remove_nodes(&self, _nodes: &HashSet<NodeId>) -> Result<usize, StorageError> {
        Ok(0)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
