//! `canopy config`: configuration management commands.

use super::load_config;
use canopy_config::AppConfig;
use std::path::Path;

pub fn validate(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("   ❌ {e}");
            return Err(e);
        }
    };
    println!("   ✅ Config parsed successfully");

    let warnings = warnings(&config);
    if warnings.is_empty() {
        println!("   ✅ All checks passed");
    } else {
        println!();
        for w in &warnings {
            println!("   ⚠️  {w}");
        }
    }

    println!();
    println!("   Data dir:   {}", config.storage.data_dir.display());
    println!("   Retrieval:  {} (top {}, {:?})", config.retrieval.backend, config.retrieval.top_k, config.retrieval.scope);
    println!("   Embedding:  {} ({} dims)", config.embedding.provider, config.embedding.dimensions);
    println!("   Model:      {}", config.generation.model);
    Ok(())
}

pub fn show(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

/// Settings that are valid but probably not what the user wants.
fn warnings(config: &AppConfig) -> Vec<&'static str> {
    let mut warnings = Vec::new();
    if config.generation.api_key.is_none() {
        warnings.push("No API key set (set CANOPY_API_KEY or OPENAI_API_KEY); `canopy chat` will fail");
    }
    if config.retrieval.backend == "none" {
        warnings.push("Retrieval backend is 'none': contexts will contain inherited turns only");
    }
    if config.retrieval.backend == "memory" {
        warnings.push("Retrieval backend is 'memory': recall is limited to messages still buffered");
    }
    if config.forest.default_context_turns > config.forest.default_max_turns {
        warnings.push("default_context_turns exceeds default_max_turns; only buffered turns can be inherited");
    }
    warnings
}
