//! Context payload: what a node "sees" for one turn.
//!
//! Buffer-derived entries come first (root-to-leaf, chronological within each
//! node), followed by retrieved entries (best score first). Every entry is
//! tagged with its provenance and the title path of its originating node.

use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageId, NodeId, Role, Timestamp};

/// Where a context entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Verbatim from a node buffer on the ancestor chain
    Buffer,
    /// Recalled from the vector index
    Retrieval,
}

/// Which nodes are eligible for long-range recollection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopePolicy {
    /// The node itself and its ancestors
    #[default]
    Lineage,
    /// Every node in the forest
    Global,
    /// Every node except sibling branches of the node's own tree
    GlobalExcludingSiblings,
}

/// A single entry of an assembled context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub message_id: MessageId,
    pub role: Role,
    pub text: String,
    pub node_id: NodeId,
    pub timestamp: Timestamp,
    pub provenance: Provenance,
    /// Titles from the root down to the originating node
    pub source_node_path: Vec<String>,
    /// Similarity score, for retrieved entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl ContextEntry {
    pub fn from_buffer(message: &Message, source_node_path: Vec<String>) -> Self {
        Self {
            message_id: message.id.clone(),
            role: message.role,
            text: message.text.clone(),
            node_id: message.node_id.clone(),
            timestamp: message.timestamp,
            provenance: Provenance::Buffer,
            source_node_path,
            score: None,
        }
    }
}

/// Non-fatal problems encountered while assembling context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextWarning {
    /// Retrieval failed; the payload is buffer-only
    RetrievalUnavailable { reason: String },
}

/// Statistics about an assembled payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadMetadata {
    pub buffer_entries: usize,
    pub retrieved_entries: usize,
    pub duplicates_dropped: usize,
    /// Retrieved entries dropped to respect the token budget
    pub budget_dropped: usize,
    pub estimated_tokens: usize,
}

/// The ordered context handed to a generator for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPayload {
    pub node_id: NodeId,
    /// Nothing at or after this point was retrieved
    pub cutoff: Timestamp,
    pub entries: Vec<ContextEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ContextWarning>,
    pub metadata: PayloadMetadata,
}

impl ContextPayload {
    pub fn buffer_entries(&self) -> impl Iterator<Item = &ContextEntry> {
        self.entries
            .iter()
            .filter(|e| e.provenance == Provenance::Buffer)
    }

    pub fn retrieved_entries(&self) -> impl Iterator<Item = &ContextEntry> {
        self.entries
            .iter()
            .filter(|e| e.provenance == Provenance::Retrieval)
    }

    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Flatten into the outbound shape a generator consumes.
    pub fn to_prompt(&self) -> Vec<PromptMessage> {
        self.entries.iter().map(PromptMessage::from).collect()
    }
}

/// One entry of the outbound prompt: `{role, text, provenance, source_node_path}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub text: String,
    pub provenance: Provenance,
    pub source_node_path: Vec<String>,
}

impl From<&ContextEntry> for PromptMessage {
    fn from(e: &ContextEntry) -> Self {
        Self {
            role: e.role,
            text: e.text.clone(),
            provenance: e.provenance,
            source_node_path: e.source_node_path.clone(),
        }
    }
}

impl PromptMessage {
    /// Text as it should be shown to a model. Recalled entries carry their
    /// origin so the model can weigh or cite them.
    pub fn render(&self) -> String {
        match self.provenance {
            Provenance::Buffer => self.text.clone(),
            Provenance::Retrieval => format!(
                "[Recalled from {}] {}",
                self.source_node_path.join(" / "),
                self.text
            ),
        }
    }
}
