//! Generator trait: the language model seen as an opaque text source.
//!
//! A generator receives an assembled context plus the new user turn and
//! answers with a finite stream of text fragments. Each call to `generate`
//! starts a fresh stream, so a failed stream is retried by simply calling
//! again. The core only consumes the stream once it is complete.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::GenerationError;
use crate::message::NodeId;
use crate::payload::PromptMessage;

/// Stream of reply fragments.
pub type FragmentStream = mpsc::Receiver<std::result::Result<String, GenerationError>>;

/// Everything a generator needs for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Node the turn belongs to
    pub node_id: NodeId,

    /// Assembled context, excluding the new user turn
    pub context: Vec<PromptMessage>,

    /// The user turn being answered
    pub user_turn: String,
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// A human-readable name (e.g., "openai", "scripted").
    fn name(&self) -> &str;

    /// Start generating a reply.
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> std::result::Result<FragmentStream, GenerationError>;
}

/// Drain a fragment stream into the full reply text.
///
/// Fails on the first errored fragment; partial text is discarded so that a
/// reply is either appended whole or not at all.
pub async fn collect_reply(
    mut stream: FragmentStream,
) -> std::result::Result<String, GenerationError> {
    let mut reply = String::new();
    while let Some(fragment) = stream.recv().await {
        reply.push_str(&fragment?);
    }
    Ok(reply)
}

/// Wrap an already-complete reply as a single-fragment stream.
pub async fn single_fragment(text: String) -> FragmentStream {
    let (tx, rx) = mpsc::channel(1);
    let _ = tx.send(Ok(text)).await;
    rx
}
