//! Embedder trait: text in, fixed-length vector out.
//!
//! The model behind an embedder is opaque to the rest of the system. The only
//! contract is that every vector an embedder returns has `dimensions()` entries.

use async_trait::async_trait;
use crate::error::EmbeddingError;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// A human-readable name (e.g., "hashing", "openai").
    fn name(&self) -> &str;

    /// Length of every vector this embedder produces.
    fn dimensions(&self) -> usize;

    /// Embed a single text. May be slow; callers must not hold locks across it.
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError>;
}

/// Reject vectors of the wrong length before they reach a store.
pub fn check_dimensions(expected: usize, vector: &[f32]) -> std::result::Result<(), EmbeddingError> {
    if vector.len() != expected {
        return Err(EmbeddingError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}
