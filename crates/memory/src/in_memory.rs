//! In-memory vector store: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use canopy_core::error::StorageError;
use canopy_core::memory::{ScoredEntry, VectorEntry, VectorQuery, VectorStore};
use canopy_core::message::{MessageId, NodeId};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::vector::rank;

#[derive(Debug, Default)]
pub(crate) struct Entries {
    pub(crate) items: Vec<Arc<VectorEntry>>,
    pub(crate) ids: HashSet<MessageId>,
}

impl Entries {
    /// Returns false if the message was already indexed.
    pub(crate) fn push(&mut self, entry: VectorEntry) -> bool {
        if !self.ids.insert(entry.message_id.clone()) {
            return false;
        }
        self.items.push(Arc::new(entry));
        true
    }

    pub(crate) fn remove_nodes(&mut self, nodes: &HashSet<NodeId>) -> usize {
        let before = self.items.len();
        let ids = &mut self.ids;
        self.items.retain(|e| {
            let keep = !nodes.contains(&e.node_id);
            if !keep {
                ids.remove(&e.message_id);
            }
            keep
        });
        before - self.items.len()
    }
}

/// Score a consistent snapshot of the entries without holding the lock.
pub(crate) async fn search_snapshot(
    entries: &RwLock<Entries>,
    query: &VectorQuery,
) -> Vec<ScoredEntry> {
    if query.top_k == 0 {
        return Vec::new();
    }
    let snapshot: Vec<Arc<VectorEntry>> = entries.read().await.items.clone();
    rank(snapshot.iter().map(|e| e.as_ref()), query)
}

/// Keeps every entry in a `Vec`. Nothing survives the process.
pub struct InMemoryVectorStore {
    entries: RwLock<Entries>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
        }
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert(&self, entry: VectorEntry) -> Result<(), StorageError> {
        self.entries.write().await.push(entry);
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
        Ok(self.entries.write().await.remove_nodes(nodes))
    }

    async fn clear(&self) -> Result<(), StorageError> {
        *self.entries.write().await = Entries::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::memory::NodeScope;
    use canopy_core::message::{Role, Timestamp};

    fn entry(node: &str, ts: u64, embedding: Vec<f32>) -> VectorEntry {
        VectorEntry {
            message_id: MessageId::new(),
            node_id: NodeId::from(node),
            role: Role::User,
            timestamp: Timestamp(ts),
            text: format!("{node}@{ts}"),
            embedding,
        }
    }

    fn query(top_k: usize) -> VectorQuery {
        VectorQuery {
            embedding: vec![1.0, 0.0],
            top_k,
            scope: NodeScope::Global,
            before: None,
            min_score: 0.0,
        }
    }

    #[tokio::test]
    async fn insert_and_search() {
        let store = InMemoryVectorStore::new();
        store.insert(entry("a", 1, vec![1.0, 0.0])).await.unwrap();
        store.insert(entry("a", 2, vec![0.0, 1.0])).await.unwrap();
        store.insert(entry("b", 3, vec![0.7, 0.7])).await.unwrap();

        let results = store.search(&query(10)).await.unwrap();
        // The orthogonal entry scores 0.0, which still meets a 0.0 floor
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].entry.text, "a@1");
        assert_eq!(results[1].entry.text, "b@3");
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn duplicate_message_ids_are_ignored() {
        let store = InMemoryVectorStore::new();
        let e = entry("a", 1, vec![1.0, 0.0]);
        store.insert(e.clone()).await.unwrap();
        store.insert(e.clone()).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.contains(&e.message_id).await.unwrap());
    }

    #[tokio::test]
    async fn zero_top_k_is_empty() {
        let store = InMemoryVectorStore::new();
        store.insert(entry("a", 1, vec![1.0, 0.0])).await.unwrap();
        assert!(store.search(&query(0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_nodes_and_clear() {
        let store = InMemoryVectorStore::new();
        let gone = entry("a", 1, vec![1.0, 0.0]);
        store.insert(gone.clone()).await.unwrap();
        store.insert(entry("b", 2, vec![1.0, 0.0])).await.unwrap();

        let removed = store
            .remove_nodes(&HashSet::from([NodeId::from("a")]))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!store.contains(&gone.message_id).await.unwrap());

        store.clear().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_writers_and_readers() {
        let store = Arc::new(InMemoryVectorStore::new());
        let mut handles = Vec::new();
        for w in 0..8u64 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for i in 0..25u64 {
                    store
                        .insert(entry("n", w * 100 + i, vec![1.0, i as f32]))
                        .await
                        .unwrap();
                    let hits = store.search(&query(5)).await.unwrap();
                    assert!(hits.len() <= 5);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.count().await.unwrap(), 200);
    }
}
