//! Context assembly.
//!
//! | Part | Source | Trim strategy |
//! |------|--------|---------------|
//! | Inherited turns | Buffers on the ancestor chain | Last `context_turns` per node |
//! | Recollection | Vector index, scoped and time-bounded | Lowest score dropped first |

pub mod assembler;
pub mod token;

pub use assembler::{AssemblerConfig, ContextAssembler};
