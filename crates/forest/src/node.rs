//! Tree nodes.

use canopy_core::message::{Message, NodeId, Timestamp};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::buffer::LocalBuffer;

/// Per-node overrides of the forest defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOptions {
    /// Buffer capacity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<usize>,
    /// How many recent messages of this node are inherited into context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_turns: Option<usize>,
}

impl NodeOptions {
    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    pub fn with_context_turns(mut self, context_turns: usize) -> Self {
        self.context_turns = Some(context_turns);
        self
    }
}

/// A node in a conversation tree.
///
/// Cloning a node is cheap and shares its buffer: the clone observes every
/// append made through the forest.
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub id: NodeId,
    pub title: String,
    /// Absent for roots
    pub parent_id: Option<NodeId>,
    /// Insertion order
    pub children: Vec<NodeId>,
    pub created_at: DateTime<Utc>,
    pub context_turns: usize,
    pub(crate) options: NodeOptions,
    pub(crate) buffer: Arc<RwLock<LocalBuffer>>,
}

impl TreeNode {
    pub(crate) fn new(
        id: NodeId,
        title: String,
        parent_id: Option<NodeId>,
        context_turns: usize,
        options: NodeOptions,
        buffer: LocalBuffer,
    ) -> Self {
        Self {
            id,
            title,
            parent_id,
            children: Vec::new(),
            created_at: Utc::now(),
            context_turns,
            options,
            buffer: Arc::new(RwLock::new(buffer)),
        }
    }

    /// Shared handle to the node's buffer.
    pub fn buffer(&self) -> Arc<RwLock<LocalBuffer>> {
        Arc::clone(&self.buffer)
    }

    /// The last `context_turns` messages stamped at or before `cutoff`,
    /// oldest first. Copied out under a single read of the buffer.
    pub fn inherited(&self, cutoff: Timestamp) -> Vec<Message> {
        let buffer = self.buffer.read();
        let eligible: Vec<&Message> = buffer.all().filter(|m| m.timestamp <= cutoff).collect();
        let skip = eligible.len().saturating_sub(self.context_turns);
        eligible.into_iter().skip(skip).cloned().collect()
    }
}
