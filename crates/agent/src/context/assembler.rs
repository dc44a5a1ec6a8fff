//! Context assembly: what a node sees for one turn.
//!
//! Two sources are merged into a single ordered payload:
//!
//! 1. **Inherited buffers**: the recent turns of every node on the
//!    root-to-node chain, root first, chronological within each node.
//!    Sibling buffers are never read.
//! 2. **Retrieval**: messages from anywhere in the allowed scope that are
//!    semantically close to the current query and strictly older than the
//!    cutoff, best first.
//!
//! Retrieved messages already present from step 1 are dropped, so every
//! message appears once and buffer provenance wins.
//!
//! # Failure policy
//!
//! A failed retrieval never fails the turn: the payload is returned
//! buffer-only with a [`ContextWarning::RetrievalUnavailable`].

use crate::context::token;
use canopy_core::error::Result;
use canopy_core::memory::NodeScope;
use canopy_core::message::{MessageId, NodeId, Timestamp};
use canopy_core::payload::{
    ContextEntry, ContextPayload, ContextWarning, PayloadMetadata, Provenance, ScopePolicy,
};
use canopy_forest::Forest;
use canopy_memory::VectorIndex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Retrieval settings for assembly.
#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// Maximum retrieved entries per payload
    pub top_k: usize,
    pub scope: ScopePolicy,
    /// Token budget for retrieved entries; lowest-ranked are dropped first
    pub max_retrieved_tokens: Option<usize>,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            scope: ScopePolicy::Lineage,
            max_retrieved_tokens: None,
        }
    }
}

/// Builds context payloads from a forest and a shared vector index.
pub struct ContextAssembler {
    forest: Arc<Forest>,
    index: Arc<VectorIndex>,
    config: AssemblerConfig,
}

impl ContextAssembler {
    pub fn new(forest: Arc<Forest>, index: Arc<VectorIndex>, config: AssemblerConfig) -> Self {
        Self {
            forest,
            index,
            config,
        }
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    /// Assemble the context of `node_id` as of `cutoff`.
    ///
    /// Buffer messages stamped at or before `cutoff` are inherited; retrieval
    /// only considers messages stamped strictly before it. `query` defaults
    /// to the newest inherited message.
    ///
    /// Fails only with `NodeNotFound`.
    pub async fn build_context(
        &self,
        node_id: &NodeId,
        cutoff: Timestamp,
        query: Option<&str>,
    ) -> Result<ContextPayload> {
        let chain = self.forest.ancestors(node_id)?;

        // Step 1: inherited buffers, root to node
        let mut entries: Vec<ContextEntry> = Vec::new();
        let mut path: Vec<String> = Vec::with_capacity(chain.len());
        for node in &chain {
            path.push(node.title.clone());
            entries.extend(
                node.inherited(cutoff)
                    .iter()
                    .map(|m| ContextEntry::from_buffer(m, path.clone())),
            );
        }
        let buffer_count = entries.len();
        let mut metadata = PayloadMetadata {
            buffer_entries: buffer_count,
            ..Default::default()
        };
        let mut warnings = Vec::new();

        // Step 2: retrieval
        let query_text = query
            .map(str::to_string)
            .or_else(|| entries.last().map(|e| e.text.clone()));

        if let Some(query_text) = query_text.filter(|_| self.config.top_k > 0) {
            let scope = self.scope_for(node_id)?;
            // Over-fetch so deduplication cannot starve the result
            let fetch = self.config.top_k.saturating_add(buffer_count);
            match self
                .index
                .retrieve_relevant(&query_text, fetch, scope, Some(cutoff))
                .await
            {
                Ok(hits) => {
                    // Step 3: deduplicate against inherited messages
                    let seen: HashSet<&MessageId> = entries.iter().map(|e| &e.message_id).collect();
                    let mut retrieved = Vec::new();
                    for hit in hits {
                        if seen.contains(&hit.entry.message_id) {
                            metadata.duplicates_dropped += 1;
                            continue;
                        }
                        if retrieved.len() == self.config.top_k {
                            break;
                        }
                        let Ok(source_node_path) = self.forest.get_path(&hit.entry.node_id) else {
                            debug!(node_id = %hit.entry.node_id, "Skipping entry from unknown node");
                            continue;
                        };
                        retrieved.push(ContextEntry {
                            message_id: hit.entry.message_id,
                            role: hit.entry.role,
                            text: hit.entry.text,
                            node_id: hit.entry.node_id,
                            timestamp: hit.entry.timestamp,
                            provenance: Provenance::Retrieval,
                            source_node_path,
                            score: Some(hit.score),
                        });
                    }

                    if let Some(budget) = self.config.max_retrieved_tokens {
                        let mut used = 0;
                        let keep = retrieved
                            .iter()
                            .take_while(|e| {
                                used += token::estimate_entry_tokens(e);
                                used <= budget
                            })
                            .count();
                        metadata.budget_dropped = retrieved.len() - keep;
                        retrieved.truncate(keep);
                    }

                    metadata.retrieved_entries = retrieved.len();
                    // Step 4: buffer entries first, then retrieved
                    entries.extend(retrieved);
                }
                Err(e) => {
                    warn!(
                        node_id = %node_id,
                        error = %e,
                        "Retrieval failed, continuing with buffer-only context"
                    );
                    warnings.push(ContextWarning::RetrievalUnavailable {
                        reason: e.to_string(),
                    });
                }
            }
        }

        metadata.estimated_tokens = token::estimate_entries_tokens(&entries);
        debug!(
            node_id = %node_id,
            cutoff = %cutoff,
            buffer = metadata.buffer_entries,
            retrieved = metadata.retrieved_entries,
            duplicates = metadata.duplicates_dropped,
            tokens = metadata.estimated_tokens,
            "Context assembled"
        );

        Ok(ContextPayload {
            node_id: node_id.clone(),
            cutoff,
            entries,
            warnings,
            metadata,
        })
    }

    fn scope_for(&self, node_id: &NodeId) -> Result<NodeScope> {
        Ok(match self.config.scope {
            ScopePolicy::Lineage => NodeScope::Only(self.forest.lineage_ids(node_id)?),
            ScopePolicy::Global => NodeScope::Global,
            ScopePolicy::GlobalExcludingSiblings => {
                NodeScope::Except(self.forest.sibling_branch_ids(node_id)?)
            }
        })
    }
}
