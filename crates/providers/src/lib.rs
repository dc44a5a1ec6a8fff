//! Embedding and generation collaborators for Canopy.
//!
//! Embedders implement `canopy_core::Embedder`, generators implement
//! `canopy_core::Generator`. The factories below pick an implementation from
//! configuration.

pub mod openai_compat;

pub use openai_compat::{OpenAiCompatEmbedder, OpenAiCompatGenerator};

use canopy_config::{EmbeddingConfig, GenerationConfig};
use canopy_core::embedding::Embedder;
use canopy_core::error::{Error, GenerationError};
use canopy_core::generation::Generator;
use canopy_memory::HashingEmbedder;
use std::sync::Arc;
use tracing::debug;

/// Build the embedder named by `embedding.provider`.
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, Error> {
    debug!(provider = %config.provider, dimensions = config.dimensions, "Building embedder");
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(config.dimensions))),
        "openai_compat" => {
            let api_key = resolve_key(&config.api_url, config.api_key.as_deref()).ok_or_else(|| {
                Error::Config {
                    message: "embedding.api_key is required for the openai_compat embedder"
                        .into(),
                }
            })?;
            Ok(Arc::new(OpenAiCompatEmbedder::new(
                &config.api_url,
                &api_key,
                config.model.clone(),
                config.dimensions,
            )))
        }
        other => Err(Error::Config {
            message: format!("unknown embedding provider '{other}'"),
        }),
    }
}

/// Build the streaming generator used for full turns.
pub fn build_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>, GenerationError> {
    let api_key = resolve_key(&config.api_url, config.api_key.as_deref()).ok_or_else(|| {
        GenerationError::NotConfigured(
            "no API key; set CANOPY_API_KEY or generation.api_key".into(),
        )
    })?;
    debug!(model = %config.model, api_url = %config.api_url, "Building generator");
    Ok(Arc::new(OpenAiCompatGenerator::new(
        &config.api_url,
        &api_key,
        config.model.clone(),
        config.temperature,
    )))
}

/// Local endpoints (Ollama, vLLM) accept any key.
fn resolve_key(api_url: &str, api_key: Option<&str>) -> Option<String> {
    match api_key.filter(|k| !k.is_empty()) {
        Some(key) => Some(key.to_string()),
        None if is_local(api_url) => Some("local".to_string()),
        None => None,
    }
}

fn is_local(api_url: &str) -> bool {
    api_url.contains("://localhost") || api_url.contains("://127.0.0.1")
}
