//! Error types for the Canopy domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant. None of these are fatal to
//! the process; every error is scoped to a single node or turn.

use crate::message::NodeId;
use thiserror::Error;

/// The top-level error type for all Canopy operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Forest errors ---
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // --- Retrieval errors ---
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    // --- Generation errors ---
    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    // --- Persistence errors ---
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidInput(message.into())
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum EmbeddingError {
    #[error("Embedding backend failed: {0}")]
    Backend(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Cannot embed empty text")]
    EmptyInput,
}

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("I/O failure: {0}")]
    Io(String),

    #[error("Corrupt persisted state: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Rate limited by generator, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Generator not configured: {0}")]
    NotConfigured(String),
}
