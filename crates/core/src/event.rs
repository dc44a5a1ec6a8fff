//! Domain event system: decoupled communication between bounded contexts.
//!
//! Events are published when something interesting happens in the forest.
//! Other components can subscribe to react without tight coupling.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::message::{MessageId, NodeId, Role, Timestamp};

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A node was created (root when `parent_id` is `None`)
    NodeCreated {
        node_id: NodeId,
        parent_id: Option<NodeId>,
        title: String,
    },

    /// A message was appended to a node buffer
    MessageAppended {
        node_id: NodeId,
        message_id: MessageId,
        role: Role,
        timestamp: Timestamp,
    },

    /// A message reached the vector index
    MessageIndexed { message_id: MessageId },

    /// Embedding failed; the message is queued for re-indexing
    IndexingDeferred { message_id: MessageId, reason: String },

    /// Context was assembled without retrieval
    RetrievalDegraded { node_id: NodeId, reason: String },

    /// A full turn (user message + reply) finished
    TurnCompleted {
        node_id: NodeId,
        reply_id: MessageId,
        attempts: u32,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
