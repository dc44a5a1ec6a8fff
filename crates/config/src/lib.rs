//! Configuration loading, validation, and management for Canopy.
//!
//! Loads configuration from `~/.canopy/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use canopy_core::payload::ScopePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.canopy/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Node defaults
    #[serde(default)]
    pub forest: ForestConfig,

    /// Vector retrieval settings
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Embedding collaborator
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Language-model collaborator
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Where state is persisted
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestConfig {
    /// Buffer capacity for new nodes
    #[serde(default = "default_max_turns")]
    pub default_max_turns: usize,

    /// How many recent turns of each node are inherited verbatim
    #[serde(default = "default_context_turns")]
    pub default_context_turns: usize,
}

fn default_max_turns() -> usize {
    10
}
fn default_context_turns() -> usize {
    6
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            default_max_turns: default_max_turns(),
            default_context_turns: default_context_turns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// "memory", "file" or "none"
    #[serde(default = "default_retrieval_backend")]
    pub backend: String,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Similarity floor below which a match is not relevant
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,

    #[serde(default)]
    pub scope: ScopePolicy,

    /// Optional token budget for retrieved entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retrieved_tokens: Option<usize>,
}

fn default_retrieval_backend() -> String {
    "file".into()
}
fn default_top_k() -> usize {
    5
}

/// Largest accepted `retrieval.top_k`.
pub const MAX_TOP_K: usize = 1000;
fn default_min_similarity() -> f32 {
    0.1
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            backend: default_retrieval_backend(),
            top_k: default_top_k(),
            min_similarity: default_min_similarity(),
            scope: ScopePolicy::default(),
            max_retrieved_tokens: None,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// "hashing" (local, deterministic) or "openai_compat"
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_embedding_provider() -> String {
    "hashing".into()
}
fn default_dimensions() -> usize {
    256
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_api_url() -> String {
    "https://api.openai.com/v1".into()
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            dimensions: default_dimensions(),
            model: default_embedding_model(),
            api_url: default_api_url(),
            api_key: None,
        }
    }
}

impl std::fmt::Debug for EmbeddingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingConfig")
            .field("provider", &self.provider)
            .field("dimensions", &self.dimensions)
            .field("model", &self.model)
            .field("api_url", &self.api_url)
            .field("api_key", &redact(&self.api_key))
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Attempts per turn before a failed stream is reported
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_attempts() -> u32 {
    2
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_attempts: default_max_attempts(),
            api_key: None,
        }
    }
}

impl std::fmt::Debug for GenerationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationConfig")
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_attempts", &self.max_attempts)
            .field("api_key", &redact(&self.api_key))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Holds `forest.json` and `vectors.jsonl`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    AppConfig::config_dir().join("data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    pub fn forest_path(&self) -> PathBuf {
        self.data_dir.join("forest.json")
    }

    pub fn vectors_path(&self) -> PathBuf {
        self.data_dir.join("vectors.jsonl")
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.canopy/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `CANOPY_DATA_DIR`
    /// - `CANOPY_API_KEY`, falling back to `OPENAI_API_KEY`
    /// - `CANOPY_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_env(&Self::config_dir().join("config.toml"))
    }

    /// Load from `path`, then apply the same environment overrides as [`load`](Self::load).
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("CANOPY_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }

        let key = std::env::var("CANOPY_API_KEY")
            .ok()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        if let Some(key) = key {
            if self.generation.api_key.is_none() {
                self.generation.api_key = Some(key.clone());
            }
            if self.embedding.api_key.is_none() {
                self.embedding.api_key = Some(key);
            }
        }

        if let Ok(model) = std::env::var("CANOPY_MODEL") {
            self.generation.model = model;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".canopy")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.forest.default_max_turns == 0 {
            return Err(ConfigError::ValidationError(
                "forest.default_max_turns must be > 0".into(),
            ));
        }

        if self.forest.default_context_turns == 0 {
            return Err(ConfigError::ValidationError(
                "forest.default_context_turns must be > 0".into(),
            ));
        }

        if self.retrieval.top_k > MAX_TOP_K {
            return Err(ConfigError::ValidationError(format!(
                "retrieval.top_k must be at most {MAX_TOP_K}"
            )));
        }

        if !(-1.0..=1.0).contains(&self.retrieval.min_similarity) {
            return Err(ConfigError::ValidationError(
                "retrieval.min_similarity must be between -1.0 and 1.0".into(),
            ));
        }

        if !matches!(self.retrieval.backend.as_str(), "memory" | "file" | "none") {
            return Err(ConfigError::ValidationError(format!(
                "retrieval.backend '{}' is not one of memory, file, none",
                self.retrieval.backend
            )));
        }

        if !matches!(self.embedding.provider.as_str(), "hashing" | "openai_compat") {
            return Err(ConfigError::ValidationError(format!(
                "embedding.provider '{}' is not one of hashing, openai_compat",
                self.embedding.provider
            )));
        }

        if self.embedding.dimensions == 0 {
            return Err(ConfigError::ValidationError(
                "embedding.dimensions must be > 0".into(),
            ));
        }

        if self.generation.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "generation.max_attempts must be > 0".into(),
            ));
        }

        if self.generation.temperature < 0.0 || self.generation.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "generation.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        Ok(())
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for canopy_core::Error {
    fn from(err: ConfigError) -> Self {
        canopy_core::Error::Config {
            message: err.to_string(),
        }
    }
}
