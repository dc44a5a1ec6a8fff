//! # Canopy Forest
//!
//! Tree-shaped conversations held in a flat id-indexed table. Each node owns
//! a bounded [`LocalBuffer`] of its recent turns; all nodes share a logical
//! clock so timestamps compare across the whole forest.

pub mod buffer;
pub mod clock;
pub mod forest;
pub mod node;
pub mod snapshot;

pub use buffer::LocalBuffer;
pub use clock::LogicalClock;
pub use forest::{Forest, ForestDefaults};
pub use node::{NodeOptions, TreeNode};
pub use snapshot::{BufferRecord, ForestSnapshot, NodeRecord, SnapshotStore};
