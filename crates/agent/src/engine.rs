//! The conversation engine: the inbound surface of a forest.
//!
//! Owns the forest, the shared vector index and the assembler, and wires
//! them together for the operations callers use: create nodes, append
//! messages, build context, run full turns, persist.

use crate::context::assembler::{AssemblerConfig, ContextAssembler};
use canopy_config::AppConfig;
use canopy_core::embedding::Embedder;
use canopy_core::error::{Error, GenerationError, Result};
use canopy_core::event::{DomainEvent, EventBus};
use canopy_core::generation::{GenerationRequest, Generator, collect_reply};
use canopy_core::memory::VectorStore;
use canopy_core::message::{Message, NodeId, Role, Timestamp};
use canopy_core::payload::{ContextPayload, ContextWarning, PromptMessage};
use canopy_forest::{Forest, ForestDefaults, NodeOptions, SnapshotStore, TreeNode};
use canopy_memory::{FileVectorStore, InMemoryVectorStore, NoopVectorStore, VectorIndex};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Whether an appended message reached the vector index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IndexStatus {
    Indexed,
    /// Kept in the buffer and queued; see [`ConversationEngine::reindex_pending`]
    Deferred { reason: String },
}

/// Result of a successful append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendReceipt {
    pub message: Message,
    pub index_status: IndexStatus,
}

impl AppendReceipt {
    pub fn is_indexed(&self) -> bool {
        self.index_status == IndexStatus::Indexed
    }
}

/// Result of a completed turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub user: AppendReceipt,
    pub reply: AppendReceipt,
    /// The context the reply was generated from (includes the user turn)
    pub context: ContextPayload,
    /// Generator calls made, including the successful one
    pub attempts: u32,
}

/// Result of a re-indexing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReindexReport {
    pub indexed: usize,
    pub remaining: usize,
}

/// Engine tuning that does not belong to the forest or the index.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub assembler: AssemblerConfig,
    /// Generator attempts per turn
    pub max_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            assembler: AssemblerConfig::default(),
            max_attempts: 2,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            assembler: AssemblerConfig {
                top_k: config.retrieval.top_k,
                scope: config.retrieval.scope,
                max_retrieved_tokens: config.retrieval.max_retrieved_tokens,
            },
            max_attempts: config.generation.max_attempts.max(1),
        }
    }
}

pub struct ConversationEngine {
    forest: Arc<Forest>,
    index: Arc<VectorIndex>,
    assembler: ContextAssembler,
    events: Arc<EventBus>,
    /// Messages whose embedding failed, oldest first
    pending: Mutex<Vec<Message>>,
    /// One lock per node, held for a whole turn
    turn_locks: Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<()>>>>,
    max_attempts: u32,
    snapshots: Option<SnapshotStore>,
}

impl ConversationEngine {
    pub fn new(forest: Forest, index: VectorIndex, settings: EngineSettings) -> Self {
        let forest = Arc::new(forest);
        let index = Arc::new(index);
        let assembler =
            ContextAssembler::new(Arc::clone(&forest), Arc::clone(&index), settings.assembler);
        Self {
            forest,
            index,
            assembler,
            events: Arc::new(EventBus::default()),
            pending: Mutex::new(Vec::new()),
            turn_locks: Mutex::new(HashMap::new()),
            max_attempts: settings.max_attempts.max(1),
            snapshots: None,
        }
    }

    /// Persist the forest through `store` on [`save`](Self::save).
    pub fn with_snapshot_store(mut self, store: SnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Open the engine described by `config`, using the configured embedder.
    pub async fn open(config: &AppConfig) -> Result<Self> {
        let embedder = canopy_providers::build_embedder(&config.embedding)?;
        Self::open_with(config, embedder).await
    }

    /// Open the engine described by `config` with an explicit embedder.
    ///
    /// The forest is rehydrated before the vector store is touched. Messages
    /// left pending by the previous run are queued again, buffered or not,
    /// along with buffered messages missing from the index.
    pub async fn open_with(config: &AppConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let defaults = ForestDefaults {
            max_turns: config.forest.default_max_turns,
            context_turns: config.forest.default_context_turns,
        };
        let snapshots = SnapshotStore::new(config.storage.forest_path());
        let (forest, carried) = match snapshots.load()? {
            Some(mut snapshot) => {
                let carried = std::mem::take(&mut snapshot.pending);
                (Forest::restore(snapshot, defaults)?, carried)
            }
            None => (Forest::new(defaults), Vec::new()),
        };

        let store: Arc<dyn VectorStore> = match config.retrieval.backend.as_str() {
            "memory" => Arc::new(InMemoryVectorStore::new()),
            "file" => Arc::new(FileVectorStore::open(config.storage.vectors_path())?),
            "none" => Arc::new(NoopVectorStore),
            other => {
                return Err(Error::Config {
                    message: format!("unknown retrieval backend '{other}'"),
                });
            }
        };
        let index = VectorIndex::new(embedder, store)
            .with_min_similarity(config.retrieval.min_similarity);

        let engine = Self::new(forest, index, EngineSettings::from_config(config))
            .with_snapshot_store(snapshots);
        if config.retrieval.backend != "none" {
            engine.queue_unindexed(carried).await?;
        }
        info!(
            nodes = engine.forest.len(),
            backend = %config.retrieval.backend,
            pending = engine.pending_count(),
            "Conversation engine opened"
        );
        Ok(engine)
    }

    /// Write the forest snapshot, including the re-indexing queue, if a
    /// store is attached.
    pub fn save(&self) -> Result<()> {
        if let Some(store) = &self.snapshots {
            let mut snapshot = self.forest.snapshot();
            snapshot.pending = self.pending.lock().clone();
            store.save(&snapshot)?;
            debug!(
                path = %store.path().display(),
                pending = snapshot.pending.len(),
                "Forest saved"
            );
        }
        Ok(())
    }

    async fn queue_unindexed(&self, carried: Vec<Message>) -> Result<()> {
        let mut seen = HashSet::new();
        let mut missing = Vec::new();
        for message in carried {
            if seen.insert(message.id.clone()) && !self.index.is_indexed(&message.id).await? {
                missing.push(message);
            }
        }
        for root in self.forest.all_roots() {
            let mut nodes = vec![root.clone()];
            nodes.extend(self.forest.descendants(&root.id)?);
            for node in nodes {
                let messages: Vec<Message> = node.buffer().read().all().cloned().collect();
                for message in messages {
                    if seen.insert(message.id.clone())
                        && !self.index.is_indexed(&message.id).await?
                    {
                        missing.push(message);
                    }
                }
            }
        }
        if !missing.is_empty() {
            missing.sort_by_key(|m| m.timestamp);
            warn!(count = missing.len(), "Messages missing from the index, queued");
            self.pending.lock().extend(missing);
        }
        Ok(())
    }

    // --- Inbound operations ---

    pub fn create_node(
        &self,
        title: &str,
        parent: Option<&NodeId>,
        options: NodeOptions,
    ) -> Result<TreeNode> {
        let node = self.forest.create_node(title, parent, options)?;
        self.events.publish(DomainEvent::NodeCreated {
            node_id: node.id.clone(),
            parent_id: node.parent_id.clone(),
            title: node.title.clone(),
        });
        Ok(node)
    }

    /// Append a message and index it.
    ///
    /// If embedding fails the message is still kept, the receipt reports
    /// [`IndexStatus::Deferred`], and the message is queued for
    /// [`reindex_pending`](Self::reindex_pending).
    ///
    /// Waits for any turn in progress on the node, so the append never lands
    /// between a turn's user message and its reply.
    pub async fn append_message(
        &self,
        node_id: &NodeId,
        role: Role,
        text: &str,
        timestamp: Option<Timestamp>,
    ) -> Result<AppendReceipt> {
        if !self.forest.contains(node_id) {
            return Err(Error::NodeNotFound(node_id.clone()));
        }
        let lock = self.turn_lock(node_id);
        let _turn = lock.lock().await;
        self.append_locked(node_id, role, text, timestamp).await
    }

    /// Append while the caller holds the node's turn lock.
    async fn append_locked(
        &self,
        node_id: &NodeId,
        role: Role,
        text: &str,
        timestamp: Option<Timestamp>,
    ) -> Result<AppendReceipt> {
        let message = self.forest.append_message(node_id, role, text, timestamp)?;
        self.events.publish(DomainEvent::MessageAppended {
            node_id: message.node_id.clone(),
            message_id: message.id.clone(),
            role: message.role,
            timestamp: message.timestamp,
        });

        let index_status = match self.index.index(&message).await {
            Ok(()) => {
                self.events.publish(DomainEvent::MessageIndexed {
                    message_id: message.id.clone(),
                });
                IndexStatus::Indexed
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(
                    node_id = %node_id,
                    message_id = %message.id,
                    error = %reason,
                    "Indexing failed, message queued for re-indexing"
                );
                self.pending.lock().push(message.clone());
                self.events.publish(DomainEvent::IndexingDeferred {
                    message_id: message.id.clone(),
                    reason: reason.clone(),
                });
                IndexStatus::Deferred { reason }
            }
        };

        Ok(AppendReceipt {
            message,
            index_status,
        })
    }

    /// Assemble the context of a node.
    ///
    /// Without `at`, everything recorded so far is eligible.
    pub async fn build_context(
        &self,
        node_id: &NodeId,
        at: Option<Timestamp>,
    ) -> Result<ContextPayload> {
        let cutoff = at.unwrap_or_else(|| self.forest.now().next());
        let payload = self.assembler.build_context(node_id, cutoff, None).await?;
        self.report_degradation(&payload);
        Ok(payload)
    }

    pub fn list_roots(&self) -> Vec<TreeNode> {
        self.forest.all_roots()
    }

    pub fn get_path(&self, node_id: &NodeId) -> Result<Vec<String>> {
        self.forest.get_path(node_id)
    }

    // --- Turn processing ---

    /// Run one full turn on a node.
    ///
    /// Appends the user message, assembles context as of that message,
    /// collects a complete reply from `generator`, then appends and indexes
    /// the reply. A failed or interrupted stream is restarted from scratch,
    /// up to the configured number of attempts. Turns on the same node run
    /// one at a time; turns on different nodes run concurrently.
    ///
    /// If generation ultimately fails, the user message stays in the buffer
    /// and no reply is appended.
    pub async fn run_turn(
        &self,
        node_id: &NodeId,
        user_text: &str,
        generator: &dyn Generator,
    ) -> Result<TurnOutcome> {
        self.forest.node(node_id)?;
        let lock = self.turn_lock(node_id);
        let _turn = lock.lock().await;

        let user = self
            .append_locked(node_id, Role::User, user_text, None)
            .await?;
        let context = self
            .assembler
            .build_context(node_id, user.message.timestamp, Some(user_text))
            .await?;
        self.report_degradation(&context);

        let request = GenerationRequest {
            node_id: node_id.clone(),
            context: context
                .entries
                .iter()
                .filter(|e| e.message_id != user.message.id)
                .map(PromptMessage::from)
                .collect(),
            user_turn: user.message.text.clone(),
        };

        let mut attempts = 0;
        let reply_text = loop {
            attempts += 1;
            let result = match generator.generate(request.clone()).await {
                Ok(stream) => collect_reply(stream).await,
                Err(e) => Err(e),
            };
            let err = match result {
                Ok(text) if !text.trim().is_empty() => break text,
                Ok(_) => GenerationError::StreamInterrupted("generator returned an empty reply".into()),
                Err(e) => e,
            };
            let fatal = matches!(err, GenerationError::NotConfigured(_));
            if fatal || attempts >= self.max_attempts {
                warn!(
                    node_id = %node_id,
                    attempts,
                    generator = generator.name(),
                    error = %err,
                    "Generation failed"
                );
                return Err(err.into());
            }
            warn!(node_id = %node_id, attempt = attempts, error = %err, "Generation failed, retrying");
        };

        let reply = self
            .append_locked(node_id, Role::Assistant, &reply_text, None)
            .await?;
        self.events.publish(DomainEvent::TurnCompleted {
            node_id: node_id.clone(),
            reply_id: reply.message.id.clone(),
            attempts,
        });
        info!(
            node_id = %node_id,
            attempts,
            context = context.entries.len(),
            "Turn completed"
        );

        Ok(TurnOutcome {
            user,
            reply,
            context,
            attempts,
        })
    }

    /// Retry indexing every queued message.
    pub async fn reindex_pending(&self) -> ReindexReport {
        let queued = std::mem::take(&mut *self.pending.lock());
        let mut indexed = 0;
        let mut failed = Vec::new();
        for message in queued {
            match self.index.index(&message).await {
                Ok(()) => {
                    indexed += 1;
                    self.events.publish(DomainEvent::MessageIndexed {
                        message_id: message.id.clone(),
                    });
                }
                Err(e) => {
                    debug!(message_id = %message.id, error = %e, "Re-indexing failed");
                    failed.push(message);
                }
            }
        }

        let mut pending = self.pending.lock();
        // Keep older failures ahead of anything deferred meanwhile
        failed.append(&mut pending);
        *pending = failed;
        let report = ReindexReport {
            indexed,
            remaining: pending.len(),
        };
        drop(pending);

        info!(indexed = report.indexed, remaining = report.remaining, "Re-indexing pass complete");
        report
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn turn_lock(&self, node_id: &NodeId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.turn_locks.lock().entry(node_id.clone()).or_default())
    }

    fn report_degradation(&self, payload: &ContextPayload) {
        for warning in &payload.warnings {
            match warning {
                ContextWarning::RetrievalUnavailable { reason } => {
                    self.events.publish(DomainEvent::RetrievalDegraded {
                        node_id: payload.node_id.clone(),
                        reason: reason.clone(),
                    });
                }
            }
        }
    }

    // --- Accessors ---

    pub fn forest(&self) -> &Arc<Forest> {
        &self.forest
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FailingEmbedder, FlakyStore, Script, ScriptedGenerator};
    use canopy_core::payload::{Provenance, ScopePolicy};
    use canopy_memory::HashingEmbedder;

    fn engine_with(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>) -> ConversationEngine {
        ConversationEngine::new(
            Forest::new(ForestDefaults::default()),
            VectorIndex::new(embedder, store),
            EngineSettings::default(),
        )
    }

    fn engine() -> ConversationEngine {
        engine_with(
            Arc::new(HashingEmbedder::new(256)),
            Arc::new(InMemoryVectorStore::new()),
        )
    }

    fn root(engine: &ConversationEngine, title: &str) -> NodeId {
        engine.create_node(title, None, NodeOptions::default()).unwrap().id
    }

    fn drain(rx: &mut broadcast::Receiver<Arc<DomainEvent>>) -> Vec<Arc<DomainEvent>> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn buffer_texts(engine: &ConversationEngine, node: &NodeId) -> Vec<(Role, String)> {
        engine
            .forest()
            .node(node)
            .unwrap()
            .buffer()
            .read()
            .all()
            .map(|m| (m.role, m.text.clone()))
            .collect()
    }

    #[tokio::test]
    async fn append_indexes_and_publishes() {
        let engine = engine();
        let mut rx = engine.subscribe();
        let a = root(&engine, "A");

        let receipt = engine
            .append_message(&a, Role::User, "hello forest", None)
            .await
            .unwrap();
        assert!(receipt.is_indexed());
        assert!(engine.index().is_indexed(&receipt.message.id).await.unwrap());

        let events = drain(&mut rx);
        assert!(matches!(*events[0], DomainEvent::NodeCreated { .. }));
        assert!(matches!(*events[1], DomainEvent::MessageAppended { .. }));
        assert!(matches!(*events[2], DomainEvent::MessageIndexed { .. }));
    }

    #[tokio::test]
    async fn append_errors_do_not_mutate() {
        let engine = engine();
        let a = root(&engine, "A");
        assert!(matches!(
            engine.append_message(&a, Role::User, "", None).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            engine
                .append_message(&NodeId::from("ghost"), Role::User, "hi", None)
                .await,
            Err(Error::NodeNotFound(_))
        ));
        assert!(buffer_texts(&engine, &a).is_empty());
        assert_eq!(engine.index().len().await.unwrap(), 0);
    }

    #[test]
    fn receipt_serializes_with_tagged_status() {
        let message = Message::new(NodeId::from("n"), Role::User, "hi", Timestamp(3));
        let receipt = AppendReceipt {
            message,
            index_status: IndexStatus::Deferred {
                reason: "offline".into(),
            },
        };
        let json = serde_json::to_value(&receipt).unwrap();
        assert_eq!(json["index_status"]["status"], "deferred");
        assert_eq!(json["index_status"]["reason"], "offline");
        assert_eq!(json["message"]["timestamp"], 3);
    }

    #[tokio::test]
    async fn embedding_failure_defers_but_keeps_message() {
        let embedder = Arc::new(FailingEmbedder::new(64));
        let engine = engine_with(embedder.clone(), Arc::new(InMemoryVectorStore::new()));
        let mut rx = engine.subscribe();
        let a = root(&engine, "A");

        let receipt = engine
            .append_message(&a, Role::User, "remember the milk", None)
            .await
            .unwrap();
        assert!(matches!(receipt.index_status, IndexStatus::Deferred { .. }));
        assert_eq!(buffer_texts(&engine, &a).len(), 1);
        assert_eq!(engine.pending_count(), 1);
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(**e, DomainEvent::IndexingDeferred { .. }))
        );

        // Still failing: nothing moves
        let report = engine.reindex_pending().await;
        assert_eq!(report, ReindexReport { indexed: 0, remaining: 1 });

        embedder.set_failing(false);
        let report = engine.reindex_pending().await;
        assert_eq!(report, ReindexReport { indexed: 1, remaining: 0 });
        assert!(engine.index().is_indexed(&receipt.message.id).await.unwrap());
    }

    #[tokio::test]
    async fn store_insert_failure_defers_until_store_recovers() {
        let store = Arc::new(FlakyStore::healthy());
        let engine = engine_with(Arc::new(HashingEmbedder::new(64)), store.clone());
        let a = root(&engine, "A");

        store.set_fail_inserts(true);
        let receipt = engine
            .append_message(&a, Role::User, "water the ferns", None)
            .await
            .unwrap();
        assert!(matches!(receipt.index_status, IndexStatus::Deferred { .. }));
        assert_eq!(engine.pending_count(), 1);
        assert_eq!(engine.index().len().await.unwrap(), 0);

        store.set_fail_inserts(false);
        let report = engine.reindex_pending().await;
        assert_eq!(report, ReindexReport { indexed: 1, remaining: 0 });
        assert!(engine.index().is_indexed(&receipt.message.id).await.unwrap());
    }

    #[tokio::test]
    async fn default_context_sees_everything_and_past_context_is_reproducible() {
        let engine = engine();
        let a = root(&engine, "A");
        let first = engine
            .append_message(&a, Role::User, "first", None)
            .await
            .unwrap();
        engine
            .append_message(&a, Role::Assistant, "second", None)
            .await
            .unwrap();

        let now = engine.build_context(&a, None).await.unwrap();
        assert_eq!(now.metadata.buffer_entries, 2);

        let then = engine
            .build_context(&a, Some(first.message.timestamp))
            .await
            .unwrap();
        assert_eq!(then.metadata.buffer_entries, 1);
        assert!(then.entries.iter().all(|e| e.timestamp <= first.message.timestamp));
    }

    #[tokio::test]
    async fn degraded_retrieval_is_published() {
        let engine = engine_with(
            Arc::new(HashingEmbedder::new(32)),
            Arc::new(FlakyStore::failing_searches()),
        );
        let a = root(&engine, "A");
        engine
            .append_message(&a, Role::User, "anything", None)
            .await
            .unwrap();
        let mut rx = engine.subscribe();
        let payload = engine.build_context(&a, None).await.unwrap();
        assert!(payload.is_degraded());
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(**e, DomainEvent::RetrievalDegraded { .. }))
        );
    }

    #[tokio::test]
    async fn run_turn_appends_reply_and_passes_user_turn_separately() {
        let engine = engine();
        let a = root(&engine, "Research");
        engine
            .append_message(&a, Role::User, "We study tides", None)
            .await
            .unwrap();
        let generator = ScriptedGenerator::replying(&["Tides follow the moon."]);
        let mut rx = engine.subscribe();

        let outcome = engine
            .run_turn(&a, "Why are there tides?", &generator)
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.reply.message.text, "Tides follow the moon.");
        assert_eq!(outcome.reply.message.role, Role::Assistant);
        assert!(outcome.reply.is_indexed());
        assert!(outcome.reply.message.timestamp > outcome.user.message.timestamp);

        let request = &generator.requests()[0];
        assert_eq!(request.user_turn, "Why are there tides?");
        assert!(request.context.iter().all(|m| m.text != "Why are there tides?"));
        assert!(
            request
                .context
                .iter()
                .any(|m| m.text == "We study tides" && m.provenance == Provenance::Buffer)
        );

        assert_eq!(
            buffer_texts(&engine, &a),
            vec![
                (Role::User, "We study tides".to_string()),
                (Role::User, "Why are there tides?".to_string()),
                (Role::Assistant, "Tides follow the moon.".to_string()),
            ]
        );
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(**e, DomainEvent::TurnCompleted { attempts: 1, .. }))
        );
    }

    #[tokio::test]
    async fn interrupted_stream_is_restarted_not_spliced() {
        let engine = engine();
        let a = root(&engine, "A");
        let generator = ScriptedGenerator::new(vec![
            Script::BreakAfter(vec!["Half an ".into()]),
            Script::reply("Whole answer."),
        ]);

        let outcome = engine.run_turn(&a, "question", &generator).await.unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.reply.message.text, "Whole answer.");
        assert_eq!(generator.call_count(), 2);
        let assistant: Vec<_> = buffer_texts(&engine, &a)
            .into_iter()
            .filter(|(r, _)| *r == Role::Assistant)
            .collect();
        assert_eq!(assistant.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_keep_user_message_only() {
        let engine = engine();
        let a = root(&engine, "A");
        let generator = ScriptedGenerator::new(vec![
            Script::Refuse(GenerationError::Network("down".into())),
            Script::BreakAfter(vec![]),
        ]);

        let err = engine.run_turn(&a, "hello?", &generator).await.unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
        assert_eq!(generator.call_count(), 2);
        assert_eq!(buffer_texts(&engine, &a), vec![(Role::User, "hello?".to_string())]);
    }

    #[tokio::test]
    async fn not_configured_is_not_retried() {
        let engine = engine();
        let a = root(&engine, "A");
        let generator = ScriptedGenerator::new(vec![Script::Refuse(
            GenerationError::NotConfigured("no key".into()),
        )]);
        assert!(engine.run_turn(&a, "hi", &generator).await.is_err());
        assert_eq!(generator.call_count(), 1);
    }

    #[tokio::test]
    async fn turns_on_one_node_do_not_interleave() {
        let engine = Arc::new(engine());
        let a = root(&engine, "A");
        let generator = Arc::new(ScriptedGenerator::replying(&["reply one", "reply two"]));

        let (e1, g1, n1) = (Arc::clone(&engine), Arc::clone(&generator), a.clone());
        let (e2, g2, n2) = (Arc::clone(&engine), Arc::clone(&generator), a.clone());
        let t1 = tokio::spawn(async move { e1.run_turn(&n1, "question one", g1.as_ref()).await });
        let t2 = tokio::spawn(async move { e2.run_turn(&n2, "question two", g2.as_ref()).await });
        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();

        let roles: Vec<Role> = buffer_texts(&engine, &a).into_iter().map(|(r, _)| r).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
    }

    #[tokio::test]
    async fn direct_append_waits_for_turn_in_progress() {
        let engine = Arc::new(engine());
        let a = root(&engine, "A");
        let generator = Arc::new(ScriptedGenerator::replying(&["the reply"]));

        let (e1, g1, n1) = (Arc::clone(&engine), Arc::clone(&generator), a.clone());
        let (e2, n2) = (Arc::clone(&engine), a.clone());
        let turn = tokio::spawn(async move { e1.run_turn(&n1, "question", g1.as_ref()).await });
        let append = tokio::spawn(async move {
            e2.append_message(&n2, Role::User, "intruder", None).await
        });
        turn.await.unwrap().unwrap();
        append.await.unwrap().unwrap();

        let texts: Vec<String> = buffer_texts(&engine, &a).into_iter().map(|(_, t)| t).collect();
        assert_eq!(texts, vec!["question", "the reply", "intruder"]);
    }

    #[tokio::test]
    async fn unknown_node_turn_fails_fast() {
        let engine = engine();
        let generator = ScriptedGenerator::new(vec![]);
        let err = engine
            .run_turn(&NodeId::from("ghost"), "hi", &generator)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeNotFound(_)));
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn open_save_reopen_with_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config.retrieval.backend = "file".into();
        config.retrieval.scope = ScopePolicy::Global;

        let (a, b) = {
            let engine = ConversationEngine::open(&config).await.unwrap();
            let a = root(&engine, "Trip");
            let b = engine
                .create_node("Packing", Some(&a), NodeOptions::default().with_max_turns(3))
                .unwrap()
                .id;
            engine
                .append_message(&b, Role::User, "pack the hiking boots", None)
                .await
                .unwrap();
            engine.save().unwrap();
            (a, b)
        };

        let engine = ConversationEngine::open(&config).await.unwrap();
        assert_eq!(engine.get_path(&b).unwrap(), vec!["Trip", "Packing"]);
        assert_eq!(engine.list_roots()[0].id, a);
        assert_eq!(engine.forest().node(&b).unwrap().buffer().read().capacity(), 3);
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.index().len().await.unwrap(), 1);

        let later = engine
            .append_message(&a, Role::User, "what about boots", None)
            .await
            .unwrap();
        assert!(later.message.timestamp > Timestamp(1));
    }

    #[tokio::test]
    async fn memory_backend_is_rebuilt_from_buffers_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config.retrieval.backend = "memory".into();

        {
            let engine = ConversationEngine::open(&config).await.unwrap();
            let a = root(&engine, "A");
            engine
                .append_message(&a, Role::User, "one", None)
                .await
                .unwrap();
            engine
                .append_message(&a, Role::User, "two", None)
                .await
                .unwrap();
            engine.save().unwrap();
        }

        let engine = ConversationEngine::open(&config).await.unwrap();
        assert_eq!(engine.pending_count(), 2);
        let report = engine.reindex_pending().await;
        assert_eq!(report.indexed, 2);
        assert_eq!(engine.index().len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn deferred_message_evicted_before_save_is_indexed_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config.retrieval.backend = "file".into();

        let first = {
            let embedder = Arc::new(FailingEmbedder::new(256));
            let engine = ConversationEngine::open_with(&config, embedder.clone())
                .await
                .unwrap();
            let a = engine
                .create_node("A", None, NodeOptions::default().with_max_turns(2))
                .unwrap()
                .id;
            let first = engine
                .append_message(&a, Role::User, "first", None)
                .await
                .unwrap();
            assert!(!first.is_indexed());

            embedder.set_failing(false);
            for text in ["second", "third"] {
                engine
                    .append_message(&a, Role::User, text, None)
                    .await
                    .unwrap();
            }
            let buffered: Vec<String> =
                buffer_texts(&engine, &a).into_iter().map(|(_, t)| t).collect();
            assert_eq!(buffered, vec!["second", "third"]);
            assert_eq!(engine.pending_count(), 1);
            engine.save().unwrap();
            first.message
        };

        let engine = ConversationEngine::open_with(&config, Arc::new(HashingEmbedder::new(256)))
            .await
            .unwrap();
        assert_eq!(engine.pending_count(), 1);
        let report = engine.reindex_pending().await;
        assert_eq!(report, ReindexReport { indexed: 1, remaining: 0 });
        assert!(engine.index().is_indexed(&first.id).await.unwrap());
        engine.save().unwrap();

        let engine = ConversationEngine::open_with(&config, Arc::new(HashingEmbedder::new(256)))
            .await
            .unwrap();
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.index().len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn unknown_backend_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config.retrieval.backend = "redis".into();
        assert!(matches!(
            ConversationEngine::open(&config).await,
            Err(Error::Config { .. })
        ));
    }
}
