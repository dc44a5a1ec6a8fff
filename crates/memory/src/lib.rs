//! Vector index and store implementations for Canopy.

pub mod noop;
pub mod in_memory;
pub mod file_backend;
pub mod hashing;
pub mod index;
pub mod vector;

pub use noop::NoopVectorStore;
pub use in_memory::InMemoryVectorStore;
pub use file_backend::FileVectorStore;
pub use hashing::HashingEmbedder;
pub use index::VectorIndex;
pub use vector::{compare_scored, cosine_similarity, rank};
