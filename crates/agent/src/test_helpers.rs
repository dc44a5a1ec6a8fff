//! Shared test doubles for engine and assembler tests.

use async_trait::async_trait;
use canopy_core::embedding::Embedder;
use canopy_core::error::{EmbeddingError, GenerationError, StorageError};
use canopy_core::generation::{FragmentStream, GenerationRequest, Generator};
use canopy_core::memory::{ScoredEntry, VectorEntry, VectorQuery, VectorStore};
use canopy_core::message::{MessageId, NodeId};
use canopy_memory::{HashingEmbedder, InMemoryVectorStore};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// One scripted generator call.
#[derive(Debug, Clone)]
pub enum Script {
    /// Stream these fragments, then end normally
    Reply(Vec<String>),
    /// Stream these fragments, then fail mid-stream
    BreakAfter(Vec<String>),
    /// Refuse to start a stream
    Refuse(GenerationError),
}

impl Script {
    pub fn reply(text: &str) -> Self {
        Script::Reply(text.split_inclusive(' ').map(str::to_string).collect())
    }
}

/// A generator that plays back a queue of scripted calls.
///
/// Panics if more calls are made than scripts provided.
pub struct ScriptedGenerator {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Script::reply(t)).collect())
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<FragmentStream, GenerationError> {
        self.requests.lock().unwrap().push(request);
        // Give concurrent turns a chance to interleave
        tokio::task::yield_now().await;
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("ScriptedGenerator: no more scripts");

        let (fragments, fail) = match script {
            Script::Reply(f) => (f, false),
            Script::BreakAfter(f) => (f, true),
            Script::Refuse(e) => return Err(e),
        };
        let (tx, rx) = mpsc::channel(fragments.len() + 1);
        for fragment in fragments {
            tx.send(Ok(fragment)).await.unwrap();
        }
        if fail {
            tx.send(Err(GenerationError::StreamInterrupted("connection reset".into())))
                .await
                .unwrap();
        }
        Ok(rx)
    }
}

/// A hashing embedder that can be switched into a failing state.
pub struct FailingEmbedder {
    inner: HashingEmbedder,
    failing: AtomicBool,
}

impl FailingEmbedder {
    /// Starts out failing.
    pub fn new(dimensions: usize) -> Self {
        Self {
            inner: HashingEmbedder::new(dimensions),
            failing: AtomicBool::new(true),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Embedder for FailingEmbedder {
    fn name(&self) -> &str {
        "failing"
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Backend("embedding service offline".into()));
        }
        self.inner.embed(text).await
    }
}

/// An in-memory store whose searches or inserts can be made to fail.
pub struct FlakyStore {
    inner: InMemoryVectorStore,
    fail_searches: AtomicBool,
    fail_inserts: AtomicBool,
}

impl FlakyStore {
    pub fn healthy() -> Self {
        Self {
            inner: InMemoryVectorStore::new(),
            fail_searches: AtomicBool::new(false),
            fail_inserts: AtomicBool::new(false),
        }
    }

    pub fn failing_searches() -> Self {
        let store = Self::healthy();
        store.set_fail_searches(true);
        store
    }

    pub fn set_fail_searches(&self, fail: bool) {
        self.fail_searches.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl VectorStore for FlakyStore {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn insert(&self, entry: VectorEntry) -> Result<(), StorageError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("vector backend unreachable".into()));
        }
        self.inner.insert(entry).await
    }

    async fn search(&self, query: &VectorQuery) -> Result<Vec<ScoredEntry>, StorageError> {
        if self.fail_searches.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("vector backend unreachable".into()));
        }
        self.inner.search(query).await
    }

    async fn contains(&self, message_id: &MessageId) -> Result<bool, StorageError> {
        self.inner.contains(message_id).await
    }

    async fn count(&self) -> Result<usize, StorageError> {
        self.inner.count().await
    }

    async fn remove_nodes(&self, nodes: &HashSet<NodeId>) -> Result<usize, StorageError> {
        self.inner.remove_nodes(nodes).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.inner.clear().await
    }
}
