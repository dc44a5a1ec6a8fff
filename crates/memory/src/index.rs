//! The vector index service: embed, append, and filtered recall.
//!
//! One `VectorIndex` is shared by every node of a forest. It is passed
//! explicitly to whatever needs it. Embedding runs before any store lock is
//! taken; only the final append touches the store.

use canopy_core::embedding::{Embedder, check_dimensions};
use canopy_core::error::{EmbeddingError, Error, Result};
use canopy_core::memory::{NodeScope, ScoredEntry, VectorEntry, VectorQuery, VectorStore};
use canopy_core::message::{Message, MessageId, Timestamp};
use std::sync::Arc;
use tracing::debug;

pub struct VectorIndex {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    min_similarity: f32,
}

impl VectorIndex {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            embedder,
            store,
            min_similarity: 0.0,
        }
    }

    /// Results scoring below `min` count as "no relevant context".
    pub fn with_min_similarity(mut self, min: f32) -> Self {
        self.min_similarity = min;
        self
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn min_similarity(&self) -> f32 {
        self.min_similarity
    }

    /// Embed a text and check the vector length.
    pub async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        let vector = self.embedder.embed(text).await?;
        check_dimensions(self.embedder.dimensions(), &vector)?;
        Ok(vector)
    }

    /// Embed and store a message.
    ///
    /// An embedding failure is returned as [`Error::Embedding`]; nothing is
    /// stored in that case.
    pub async fn index(&self, message: &Message) -> Result<()> {
        let embedding = self.embed(&message.text).await?;
        self.index_with_embedding(message, embedding).await
    }

    /// Store a message with a precomputed embedding.
    pub async fn index_with_embedding(&self, message: &Message, embedding: Vec<f32>) -> Result<()> {
        check_dimensions(self.embedder.dimensions(), &embedding)?;
        self.store
            .insert(VectorEntry::from_message(message, embedding))
            .await?;
        debug!(
            message_id = %message.id,
            node_id = %message.node_id,
            store = self.store.name(),
            "Message indexed"
        );
        Ok(())
    }

    pub async fn is_indexed(&self, message_id: &MessageId) -> Result<bool> {
        Ok(self.store.contains(message_id).await?)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.store.count().await?)
    }

    /// Top `top_k` entries most similar to `query`, restricted to `scope` and
    /// to timestamps strictly before `before`.
    ///
    /// Best score first, ties broken by newer timestamp. A blank query or
    /// `top_k == 0` yields nothing. Store failures surface as
    /// [`Error::RetrievalUnavailable`].
    pub async fn retrieve_relevant(
        &self,
        query: &str,
        top_k: usize,
        scope: NodeScope,
        before: Option<Timestamp>,
    ) -> Result<Vec<ScoredEntry>> {
        if top_k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let embedding = self.embed(query).await?;
        let query = VectorQuery {
            embedding,
            top_k,
            scope,
            before,
            min_score: self.min_similarity,
        };
        let results = self
            .store
            .search(&query)
            .await
            .map_err(|e| Error::RetrievalUnavailable(e.to_string()))?;
        debug!(
            hits = results.len(),
            top_k,
            before = ?before.map(|t| t.0),
            "Retrieval complete"
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::HashingEmbedder;
    use crate::in_memory::InMemoryVectorStore;
    use async_trait::async_trait;
    use canopy_core::error::StorageError;
    use canopy_core::message::{NodeId, Role};
    use std::collections::HashSet;

    fn index() -> VectorIndex {
        VectorIndex::new(
            Arc::new(HashingEmbedder::new(128)),
            Arc::new(InMemoryVectorStore::new()),
        )
    }

    fn msg(node: &str, ts: u64, text: &str) -> Message {
        Message::new(NodeId::from(node), Role::User, text, Timestamp(ts))
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        fn name(&self) -> &str {
            "broken"
        }
        fn dimensions(&self) -> usize {
            4
        }
        async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::Backend("model offline".into()))
        }
    }

    struct DownStore;

    #[async_trait]
    impl VectorStore for DownStore {
        fn name(&self) -> &str {
            "down"
        }
        async fn insert(&self, _e: VectorEntry) -> std::result::Result<(), StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn search(&self, _q: &VectorQuery) -> std::result::Result<Vec<ScoredEntry>, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
        async fn contains(&self, _id: &MessageId) -> std::result::Result<bool, StorageError> {
            Ok(false)
        }
        async fn count(&self) -> std::result::Result<usize, StorageError> {
            Ok(0)
        }
        async fn remove_nodes(&self, _n: &HashSet<NodeId>) -> std::result::Result<usize, StorageError> {
            Ok(0)
        }
        async fn clear(&self) -> std::result::Result<(), StorageError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn never_returns_entries_at_or_after_cutoff() {
        let idx = index();
        for ts in [5, 10, 15, 20, 25] {
            idx.index(&msg("a", ts, "orbital mechanics notes")).await.unwrap();
        }
        let hits = idx
            .retrieve_relevant("orbital mechanics", 10, NodeScope::Global, Some(Timestamp(20)))
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.entry.timestamp < Timestamp(20)));
        // Equal scores: newest first
        assert_eq!(hits[0].entry.timestamp, Timestamp(15));
    }

    #[tokio::test]
    async fn respects_top_k_and_sort_order() {
        let idx = index();
        idx.index(&msg("a", 1, "rocket fuel budget")).await.unwrap();
        idx.index(&msg("a", 2, "rocket budget")).await.unwrap();
        idx.index(&msg("a", 3, "weekend hiking plans")).await.unwrap();
        let hits = idx
            .retrieve_relevant("rocket budget", 2, NodeScope::Global, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].entry.text, "rocket budget");
        assert!(hits[0].score >= hits[1].score);

        let none = idx
            .retrieve_relevant("rocket", 0, NodeScope::Global, None)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn similarity_floor_means_no_context() {
        let idx = index().with_min_similarity(0.5);
        idx.index(&msg("a", 1, "sourdough starter hydration")).await.unwrap();
        let hits = idx
            .retrieve_relevant("quantum chromodynamics", 5, NodeScope::Global, None)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn embedding_failure_is_reported() {
        let idx = VectorIndex::new(Arc::new(BrokenEmbedder), Arc::new(InMemoryVectorStore::new()));
        let err = idx.index(&msg("a", 1, "hello")).await.unwrap_err();
        assert!(matches!(err, Error::Embedding(EmbeddingError::Backend(_))));
        assert_eq!(idx.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn store_failure_is_retrieval_unavailable() {
        let idx = VectorIndex::new(Arc::new(HashingEmbedder::new(16)), Arc::new(DownStore));
        let err = idx
            .retrieve_relevant("anything", 3, NodeScope::Global, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetrievalUnavailable(_)));
    }

    #[tokio::test]
    async fn wrong_dimensions_rejected() {
        let idx = index();
        let err = idx
            .index_with_embedding(&msg("a", 1, "x"), vec![1.0, 2.0])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Embedding(EmbeddingError::DimensionMismatch { expected: 128, actual: 2 })
        ));
    }
}
