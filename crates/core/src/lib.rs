//! # Canopy Core
//!
//! Domain types, traits, and error definitions for Canopy, a store of
//! tree-shaped conversations whose nodes inherit ancestor context while
//! staying isolated from their siblings.
//! This crate performs **no I/O**: it defines the domain model that all other
//! crates implement against.
//!
//! ## Design Philosophy
//!
//! External collaborators (embedding model, language model, vector backend)
//! are traits here. Implementations live in their respective crates, and are
//! passed explicitly to whatever needs them rather than living in globals.

pub mod error;
pub mod message;
pub mod memory;
pub mod embedding;
pub mod generation;
pub mod payload;
pub mod event;

// Re-export key types at crate root for ergonomics
pub use error::{EmbeddingError, Error, GenerationError, Result, StorageError};
pub use message::{Message, MessageId, NodeId, Role, Timestamp};
pub use memory::{NodeScope, ScoredEntry, VectorEntry, VectorQuery, VectorStore};
pub use embedding::Embedder;
pub use generation::{FragmentStream, GenerationRequest, Generator};
pub use payload::{
    ContextEntry, ContextPayload, ContextWarning, PayloadMetadata, PromptMessage, Provenance,
    ScopePolicy,
};
pub use event::{DomainEvent, EventBus};
