//! Subcommand implementations.
//!
//! Every command loads the forest from the data directory, does its work,
//! and saves the forest back if it changed anything.

pub mod chat;
pub mod config_cmd;
pub mod message;
pub mod node;
pub mod reindex;

use canopy_agent::ConversationEngine;
use canopy_config::AppConfig;
use std::path::Path;

pub fn load_config(path: Option<&Path>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => AppConfig::load_with_env(path),
        None => AppConfig::load(),
    };
    Ok(config.map_err(|e| format!("Failed to load config: {e}"))?)
}

/// Open the engine over the configured data directory.
///
/// The in-memory backend starts empty every run, so it is refilled from the
/// restored buffers before any command queries it.
pub async fn open_engine(
    config: &AppConfig,
) -> Result<ConversationEngine, Box<dyn std::error::Error>> {
    tracing::debug!(data_dir = %config.storage.data_dir.display(), "Opening forest");
    std::fs::create_dir_all(&config.storage.data_dir)?;
    let engine = ConversationEngine::open(config).await?;
    if config.retrieval.backend == "memory" && engine.pending_count() > 0 {
        engine.reindex_pending().await;
    }
    Ok(engine)
}

pub fn parse_node(id: &str) -> canopy_core::message::NodeId {
    canopy_core::message::NodeId::from(id.trim())
}
