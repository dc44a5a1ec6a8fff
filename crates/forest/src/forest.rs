//! The forest: every conversation tree, addressed through one id index.
//!
//! Nodes live in a flat table keyed by id; parent and child links are ids
//! resolved through that table. The index lock is only held for lookups and
//! registration. Buffers have their own locks, so appends on different nodes
//! never contend, and a reader of an ancestor buffer always sees a complete
//! snapshot of it.

use canopy_core::error::{Error, Result, StorageError};
use canopy_core::message::{Message, NodeId, Role, Timestamp};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

use crate::buffer::LocalBuffer;
use crate::clock::LogicalClock;
use crate::node::{NodeOptions, TreeNode};
use crate::snapshot::{BufferRecord, ForestSnapshot, NodeRecord};

/// Values applied to nodes created without explicit options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForestDefaults {
    pub max_turns: usize,
    pub context_turns: usize,
}

impl Default for ForestDefaults {
    fn default() -> Self {
        Self {
            max_turns: 10,
            context_turns: 6,
        }
    }
}

#[derive(Debug, Default)]
struct ForestIndex {
    nodes: HashMap<NodeId, TreeNode>,
    /// Creation order
    roots: Vec<NodeId>,
}

impl ForestIndex {
    fn get(&self, id: &NodeId) -> Result<&TreeNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| Error::NodeNotFound(id.clone()))
    }

    /// Root-to-node chain, including the node itself.
    fn chain(&self, id: &NodeId) -> Result<Vec<&TreeNode>> {
        let mut chain = vec![self.get(id)?];
        while let Some(parent_id) = chain.last().copied().and_then(|n| n.parent_id.as_ref()) {
            if chain.len() > self.nodes.len() {
                return Err(Error::Storage(StorageError::Corrupt(format!(
                    "parent chain of {id} does not terminate"
                ))));
            }
            chain.push(self.get(parent_id)?);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Breadth-first descendants, excluding the node itself.
    fn descendants(&self, id: &NodeId) -> Result<Vec<&TreeNode>> {
        let start = self.get(id)?;
        let mut out = Vec::new();
        let mut queue: VecDeque<&NodeId> = start.children.iter().collect();
        while let Some(child_id) = queue.pop_front() {
            let child = self.get(child_id)?;
            queue.extend(child.children.iter());
            out.push(child);
        }
        Ok(out)
    }
}

/// A set of independent conversation trees.
#[derive(Debug, Default)]
pub struct Forest {
    index: RwLock<ForestIndex>,
    clock: LogicalClock,
    defaults: ForestDefaults,
}

impl Forest {
    pub fn new(defaults: ForestDefaults) -> Self {
        Self {
            index: RwLock::new(ForestIndex::default()),
            clock: LogicalClock::new(),
            defaults,
        }
    }

    pub fn defaults(&self) -> ForestDefaults {
        self.defaults
    }

    /// Create a root (no parent) or a child of `parent`.
    ///
    /// Nothing is registered if the parent is unknown or the options are
    /// invalid.
    pub fn create_node(
        &self,
        title: &str,
        parent: Option<&NodeId>,
        options: NodeOptions,
    ) -> Result<TreeNode> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::invalid("node title must not be empty"));
        }
        let max_turns = options.max_turns.unwrap_or(self.defaults.max_turns);
        let context_turns = options.context_turns.unwrap_or(self.defaults.context_turns);
        if context_turns == 0 {
            return Err(Error::invalid("context_turns must be > 0"));
        }

        let id = NodeId::new();
        let buffer = LocalBuffer::new(id.clone(), max_turns)?;

        let mut index = self.index.write();
        if let Some(parent_id) = parent {
            // A fresh id can never be its own ancestor; this only trips on a
            // corrupted index.
            if index.chain(parent_id)?.iter().any(|n| n.id == id) {
                return Err(Error::invalid(format!(
                    "node {id} cannot be placed under its own descendant {parent_id}"
                )));
            }
        }

        let node = TreeNode::new(
            id.clone(),
            title.to_string(),
            parent.cloned(),
            context_turns,
            options,
            buffer,
        );
        match parent {
            Some(parent_id) => {
                if let Some(p) = index.nodes.get_mut(parent_id) {
                    p.children.push(id.clone());
                }
            }
            None => index.roots.push(id.clone()),
        }
        index.nodes.insert(id.clone(), node.clone());
        drop(index);

        info!(
            node_id = %id,
            parent_id = ?parent.map(|p| p.as_str()),
            title,
            "Node created"
        );
        Ok(node)
    }

    /// Append a message to a node's buffer.
    ///
    /// Without an explicit timestamp the next forest tick is used. An explicit
    /// timestamp advances the forest clock and must not precede the node's
    /// newest message.
    pub fn append_message(
        &self,
        node_id: &NodeId,
        role: Role,
        text: &str,
        timestamp: Option<Timestamp>,
    ) -> Result<Message> {
        if text.trim().is_empty() {
            return Err(Error::invalid("message text must not be empty"));
        }
        let buffer = self.index.read().get(node_id)?.buffer();

        let mut buffer = buffer.write();
        let message = match timestamp {
            Some(ts) => {
                let message = buffer.add_at(role, text, ts)?;
                self.clock.observe(ts);
                message
            }
            None => buffer.add_at(role, text, self.clock.tick())?,
        };
        drop(buffer);

        debug!(
            node_id = %node_id,
            message_id = %message.id,
            role = %role,
            timestamp = %message.timestamp,
            "Message appended"
        );
        Ok(message)
    }

    /// The latest timestamp issued or observed by the forest clock.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn node(&self, id: &NodeId) -> Result<TreeNode> {
        self.index.read().get(id).cloned()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.read().nodes.contains_key(id)
    }

    /// Titles from the tree root down to the node.
    pub fn get_path(&self, id: &NodeId) -> Result<Vec<String>> {
        Ok(self
            .index
            .read()
            .chain(id)?
            .into_iter()
            .map(|n| n.title.clone())
            .collect())
    }

    /// Nodes from the tree root down to and including `id`.
    pub fn ancestors(&self, id: &NodeId) -> Result<Vec<TreeNode>> {
        Ok(self
            .index
            .read()
            .chain(id)?
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn all_roots(&self) -> Vec<TreeNode> {
        let index = self.index.read();
        index
            .roots
            .iter()
            .filter_map(|id| index.nodes.get(id).cloned())
            .collect()
    }

    /// Direct children in creation order.
    pub fn children(&self, id: &NodeId) -> Result<Vec<TreeNode>> {
        let index = self.index.read();
        let node = index.get(id)?;
        node.children
            .iter()
            .map(|c| index.get(c).cloned())
            .collect()
    }

    /// Every node below `id`, breadth-first.
    pub fn descendants(&self, id: &NodeId) -> Result<Vec<TreeNode>> {
        Ok(self
            .index
            .read()
            .descendants(id)?
            .into_iter()
            .cloned()
            .collect())
    }

    /// Zero for roots.
    pub fn depth(&self, id: &NodeId) -> Result<usize> {
        Ok(self.index.read().chain(id)?.len() - 1)
    }

    /// Root of the tree containing `id`.
    pub fn tree_root(&self, id: &NodeId) -> Result<NodeId> {
        let index = self.index.read();
        let chain = index.chain(id)?;
        Ok(chain.first().map_or_else(|| id.clone(), |n| n.id.clone()))
    }

    /// The node and its ancestors.
    pub fn lineage_ids(&self, id: &NodeId) -> Result<HashSet<NodeId>> {
        Ok(self
            .index
            .read()
            .chain(id)?
            .into_iter()
            .map(|n| n.id.clone())
            .collect())
    }

    /// Nodes of the same tree that are neither ancestors nor descendants of
    /// `id`.
    pub fn sibling_branch_ids(&self, id: &NodeId) -> Result<HashSet<NodeId>> {
        let index = self.index.read();
        let chain = index.chain(id)?;
        let mut related: HashSet<&NodeId> = chain.iter().map(|n| &n.id).collect();
        related.extend(index.descendants(id)?.into_iter().map(|n| &n.id));

        let root = chain[0];
        let out: HashSet<NodeId> = index
            .descendants(&root.id)?
            .into_iter()
            .filter(|n| !related.contains(&n.id))
            .map(|n| n.id.clone())
            .collect();
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.index.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().nodes.is_empty()
    }

    /// Indented outline of every tree, one node per line.
    pub fn render_tree(&self) -> String {
        let index = self.index.read();
        let mut out = String::new();
        for root in &index.roots {
            render_branch(&index, root, "", true, true, &mut out);
        }
        out
    }

    /// Capture nodes (parents before children), buffers and the clock.
    pub fn snapshot(&self) -> ForestSnapshot {
        let index = self.index.read();
        let mut snapshot = ForestSnapshot {
            clock: self.clock.now(),
            ..Default::default()
        };

        let mut queue: VecDeque<&NodeId> = index.roots.iter().collect();
        while let Some(id) = queue.pop_front() {
            let Some(node) = index.nodes.get(id) else {
                continue;
            };
            queue.extend(node.children.iter());
            snapshot.nodes.push(NodeRecord {
                id: node.id.clone(),
                title: node.title.clone(),
                parent_id: node.parent_id.clone(),
                created_at: node.created_at,
                max_turns: node.options.max_turns,
                context_turns: node.options.context_turns,
            });
            let buffer = node.buffer.read();
            if !buffer.is_empty() {
                snapshot.buffers.push(BufferRecord {
                    node_id: node.id.clone(),
                    messages: buffer.all().cloned().collect(),
                });
            }
        }
        snapshot
    }

    /// Rehydrate a forest from a snapshot.
    ///
    /// Rejects duplicate ids, unknown parents, parent cycles and buffers for
    /// unknown nodes. Buffers holding more messages than their capacity keep
    /// the newest ones.
    pub fn restore(snapshot: ForestSnapshot, defaults: ForestDefaults) -> Result<Self> {
        let corrupt = |msg: String| Error::Storage(StorageError::Corrupt(msg));

        let mut index = ForestIndex::default();
        let mut order = Vec::with_capacity(snapshot.nodes.len());
        for record in snapshot.nodes {
            if index.nodes.contains_key(&record.id) {
                return Err(corrupt(format!("duplicate node id {}", record.id)));
            }
            let options = NodeOptions {
                max_turns: record.max_turns,
                context_turns: record.context_turns,
            };
            let max_turns = options.max_turns.unwrap_or(defaults.max_turns);
            let buffer = LocalBuffer::new(record.id.clone(), max_turns)
                .map_err(|e| corrupt(format!("node {}: {e}", record.id)))?;
            let mut node = TreeNode::new(
                record.id.clone(),
                record.title,
                record.parent_id,
                options.context_turns.unwrap_or(defaults.context_turns),
                options,
                buffer,
            );
            node.created_at = record.created_at;
            order.push(record.id.clone());
            index.nodes.insert(record.id, node);
        }

        for id in &order {
            let parent_id = index.nodes.get(id).and_then(|n| n.parent_id.clone());
            match parent_id {
                Some(parent_id) => match index.nodes.get_mut(&parent_id) {
                    Some(parent) => parent.children.push(id.clone()),
                    None => {
                        return Err(corrupt(format!(
                            "node {id} references unknown parent {parent_id}"
                        )));
                    }
                },
                None => index.roots.push(id.clone()),
            }
        }
        for id in &order {
            index.chain(id)?;
        }

        let mut last = snapshot.clock;
        for record in snapshot.buffers {
            let node = index
                .nodes
                .get(&record.node_id)
                .ok_or_else(|| corrupt(format!("buffer for unknown node {}", record.node_id)))?;
            let capacity = node.buffer.read().capacity();
            if record.messages.len() > capacity {
                warn!(
                    node_id = %record.node_id,
                    held = record.messages.len(),
                    capacity,
                    "Persisted buffer exceeds capacity, keeping newest messages"
                );
            }
            if let Some(newest) = record.messages.last() {
                last = last.max(newest.timestamp);
            }
            let restored = LocalBuffer::restore(record.node_id.clone(), capacity, record.messages)
                .map_err(|e| corrupt(format!("buffer of {}: {e}", record.node_id)))?;
            *node.buffer.write() = restored;
        }

        info!(nodes = index.nodes.len(), roots = index.roots.len(), clock = %last, "Forest restored");
        Ok(Self {
            index: RwLock::new(index),
            clock: LogicalClock::starting_at(last),
            defaults,
        })
    }
}

fn render_branch(
    index: &ForestIndex,
    id: &NodeId,
    prefix: &str,
    last: bool,
    root: bool,
    out: &mut String,
) {
    let Some(node) = index.nodes.get(id) else {
        return;
    };
    let held = node.buffer.read().len();
    let connector = match (root, last) {
        (true, _) => "",
        (false, true) => "└── ",
        (false, false) => "├── ",
    };
    out.push_str(&format!(
        "{prefix}{connector}{} [{}] ({held} msgs)\n",
        node.title, node.id
    ));

    let child_prefix = match (root, last) {
        (true, _) => prefix.to_string(),
        (false, true) => format!("{prefix}    "),
        (false, false) => format!("{prefix}│   "),
    };
    for (i, child) in node.children.iter().enumerate() {
        let is_last = i + 1 == node.children.len();
        render_branch(index, child, &child_prefix, is_last, false, out);
    }
}
