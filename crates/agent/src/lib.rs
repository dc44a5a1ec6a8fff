//! Context assembly and turn processing for a conversation forest.
//!
//! A turn runs **append → assemble → generate → append**:
//!
//! 1. **Append** the user message to its node buffer and index it
//! 2. **Assemble** context: inherited buffer turns along the ancestor chain,
//!    then long-range recollection from the vector index
//! 3. **Generate** a complete reply, restarting failed streams
//! 4. **Append** the reply to the same node and index it

pub mod context;
pub mod engine;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use context::{AssemblerConfig, ContextAssembler};
pub use engine::{
    AppendReceipt, ConversationEngine, EngineSettings, IndexStatus, ReindexReport, TurnOutcome,
};
