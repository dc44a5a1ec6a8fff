//! Local buffer: bounded log of a node's most recent turns.
//!
//! A buffer holds at most `max_turns` messages in chronological order.
//! Appending at capacity evicts the oldest message (FIFO). Evicted messages
//! are still reachable through the vector index; the buffer only bounds what
//! is inherited verbatim.

use canopy_core::error::{Error, Result};
use canopy_core::message::{Message, NodeId, Role, Timestamp};
use std::collections::VecDeque;

/// Per-node bounded message log.
#[derive(Debug, Clone)]
pub struct LocalBuffer {
    node_id: NodeId,
    max_turns: usize,
    messages: VecDeque<Message>,
    /// Last timestamp handed out or accepted
    clock: Timestamp,
    evicted: u64,
}

impl LocalBuffer {
    /// Create an empty buffer. Fails on zero capacity.
    pub fn new(node_id: NodeId, max_turns: usize) -> Result<Self> {
        if max_turns == 0 {
            return Err(Error::invalid("buffer capacity must be > 0"));
        }
        Ok(Self {
            node_id,
            max_turns,
            messages: VecDeque::with_capacity(max_turns),
            clock: Timestamp::ZERO,
            evicted: 0,
        })
    }

    /// Rebuild a buffer from persisted messages.
    ///
    /// Messages must belong to this node and be chronological. If there are
    /// more than `max_turns`, only the newest are kept.
    pub fn restore(node_id: NodeId, max_turns: usize, messages: Vec<Message>) -> Result<Self> {
        let mut buffer = Self::new(node_id, max_turns)?;
        for message in messages {
            if message.node_id != buffer.node_id {
                return Err(Error::invalid(format!(
                    "message {} belongs to node {}, not {}",
                    message.id, message.node_id, buffer.node_id
                )));
            }
            buffer.check_order(message.timestamp)?;
            buffer.push(message);
        }
        Ok(buffer)
    }

    /// Append using the buffer's own logical clock.
    pub fn add(&mut self, role: Role, text: &str) -> Result<Message> {
        let ts = self.clock.next();
        self.add_at(role, text, ts)
    }

    /// Append with an externally supplied timestamp.
    ///
    /// Fails if `text` is blank or `timestamp` is earlier than the newest
    /// message already held.
    pub fn add_at(&mut self, role: Role, text: &str, timestamp: Timestamp) -> Result<Message> {
        if text.trim().is_empty() {
            return Err(Error::invalid("message text must not be empty"));
        }
        self.check_order(timestamp)?;

        let message = Message::new(self.node_id.clone(), role, text, timestamp);
        self.push(message.clone());
        Ok(message)
    }

    fn check_order(&self, timestamp: Timestamp) -> Result<()> {
        if let Some(last) = self.messages.back() {
            if timestamp < last.timestamp {
                return Err(Error::invalid(format!(
                    "timestamp {timestamp} precedes the newest message ({}) on node {}",
                    last.timestamp, self.node_id
                )));
            }
        }
        Ok(())
    }

    fn push(&mut self, message: Message) {
        if self.messages.len() == self.max_turns {
            self.messages.pop_front();
            self.evicted += 1;
        }
        self.clock = self.clock.max(message.timestamp);
        self.messages.push_back(message);
    }

    /// The last `min(k, len)` messages, oldest first.
    pub fn recent(&self, k: usize) -> impl DoubleEndedIterator<Item = &Message> + ExactSizeIterator {
        let skip = self.messages.len().saturating_sub(k);
        self.messages.iter().skip(skip)
    }

    /// Every message held, oldest first.
    pub fn all(&self) -> impl DoubleEndedIterator<Item = &Message> + ExactSizeIterator {
        self.messages.iter()
    }

    /// Owned copy of the last `k` messages, for use after the lock is released.
    pub fn snapshot(&self, k: usize) -> Vec<Message> {
        self.recent(k).cloned().collect()
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn capacity(&self) -> usize {
        self.max_turns
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of messages pushed out since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Timestamp of the newest message held, if any.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.messages.back().map(|m| m.timestamp)
    }
}
