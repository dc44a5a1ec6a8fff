//! Vector store trait: append-only semantic recall across the forest.
//!
//! Every message said anywhere in the forest is stored once with its
//! embedding and metadata. Queries score candidates by cosine similarity,
//! restricted by node scope and by a temporal cutoff.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::StorageError;
use crate::message::{Message, MessageId, NodeId, Role, Timestamp};

/// A single indexed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    /// The message this entry references
    pub message_id: MessageId,

    /// Node the message was said in
    pub node_id: NodeId,

    /// Who said it
    pub role: Role,

    /// Position on the forest clock
    pub timestamp: Timestamp,

    /// Copy of the text, so retrieval can return content without a buffer hit
    pub text: String,

    /// Fixed-length embedding vector
    pub embedding: Vec<f32>,
}

impl VectorEntry {
    /// Build an entry for a message from a precomputed embedding.
    pub fn from_message(message: &Message, embedding: Vec<f32>) -> Self {
        Self {
            message_id: message.id.clone(),
            node_id: message.node_id.clone(),
            role: message.role,
            timestamp: message.timestamp,
            text: message.text.clone(),
            embedding,
        }
    }
}

/// An entry paired with its similarity to a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntry {
    pub entry: VectorEntry,
    pub score: f32,
}

/// Which nodes a query may draw from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NodeScope {
    /// No restriction
    #[default]
    Global,
    /// Only these nodes
    Only(HashSet<NodeId>),
    /// Every node except these
    Except(HashSet<NodeId>),
}

impl NodeScope {
    pub fn single(node_id: NodeId) -> Self {
        NodeScope::Only(HashSet::from([node_id]))
    }

    pub fn allows(&self, node_id: &NodeId) -> bool {
        match self {
            NodeScope::Global => true,
            NodeScope::Only(set) => set.contains(node_id),
            NodeScope::Except(set) => !set.contains(node_id),
        }
    }
}

/// A similarity query against a vector store.
#[derive(Debug, Clone)]
pub struct VectorQuery {
    /// Query embedding
    pub embedding: Vec<f32>,

    /// Maximum number of results
    pub top_k: usize,

    /// Node restriction
    pub scope: NodeScope,

    /// Only entries strictly earlier than this are eligible
    pub before: Option<Timestamp>,

    /// Entries scoring below this are treated as irrelevant
    pub min_score: f32,
}

impl VectorQuery {
    /// Whether an entry passes the scope and temporal filters.
    pub fn admits(&self, entry: &VectorEntry) -> bool {
        if let Some(cutoff) = self.before {
            if entry.timestamp >= cutoff {
                return false;
            }
        }
        self.scope.allows(&entry.node_id)
    }
}

/// The core VectorStore trait.
///
/// Implementations: in-memory, JSONL file, none (no-op).
/// Appends are atomic with respect to readers: a search never observes a
/// half-written entry.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// The backend name (e.g., "memory", "file", "none").
    fn name(&self) -> &str;

    /// Append an entry.
    async fn insert(&self, entry: VectorEntry) -> std::result::Result<(), StorageError>;

    /// Filtered similarity search, best first.
    async fn search(&self, query: &VectorQuery) -> std::result::Result<Vec<ScoredEntry>, StorageError>;

    /// Whether a message has been indexed.
    async fn contains(&self, message_id: &MessageId) -> std::result::Result<bool, StorageError>;

    /// Get total entry count.
    async fn count(&self) -> std::result::Result<usize, StorageError>;

    /// Drop every entry belonging to the given nodes (teardown only).
    async fn remove_nodes(&self, nodes: &HashSet<NodeId>) -> std::result::Result<usize, StorageError>;

    /// Drop everything (forest teardown).
    async fn clear(&self) -> std::result::Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(node: &str, ts: u64) -> VectorEntry {
        VectorEntry {
            message_id: MessageId::new(),
            node_id: NodeId::from(node),
            role: Role::User,
            timestamp: Timestamp(ts),
            text: "hello".into(),
            embedding: vec![1.0, 0.0],
        }
    }

    fn query(scope: NodeScope, before: Option<u64>) -> VectorQuery {
        VectorQuery {
            embedding: vec![1.0, 0.0],
            top_k: 5,
            scope,
            before: before.map(Timestamp),
            min_score: 0.0,
        }
    }

    #[test]
    fn cutoff_is_strict() {
        let q = query(NodeScope::Global, Some(20));
        assert!(q.admits(&entry("a", 19)));
        assert!(!q.admits(&entry("a", 20)));
        assert!(!q.admits(&entry("a", 21)));
    }

    #[test]
    fn scope_only_and_except() {
        let only = query(NodeScope::single(NodeId::from("a")), None);
        assert!(only.admits(&entry("a", 1)));
        assert!(!only.admits(&entry("b", 1)));

        let except = query(NodeScope::Except(HashSet::from([NodeId::from("a")])), None);
        assert!(!except.admits(&entry("a", 1)));
        assert!(except.admits(&entry("b", 1)));
    }

    #[test]
    fn entry_serializes_embedding() {
        let json = serde_json::to_string(&entry("a", 4)).unwrap();
        assert!(json.contains("\"embedding\":[1.0,0.0]"));
        assert!(json.contains("\"role\":\"user\""));
    }
}
