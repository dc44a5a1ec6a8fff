//! `canopy chat`: one full turn against the configured generator.

use super::{load_config, open_engine, parse_node};
use std::path::Path;

pub async fn run(
    config_path: Option<&Path>,
    node: &str,
    text: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let generator = canopy_providers::build_generator(&config.generation).map_err(|e| {
        format!("{e}. Set CANOPY_API_KEY or generation.api_key in the config file")
    })?;
    let engine = open_engine(&config).await?;

    eprint!("  Thinking...");
    let result = engine
        .run_turn(&parse_node(node), text, generator.as_ref())
        .await;
    eprint!("\r              \r");

    // The user message is kept even when generation fails
    engine.save()?;
    let outcome = result?;

    for line in outcome.reply.message.text.lines() {
        println!("{line}");
    }
    if outcome.context.is_degraded() {
        eprintln!("  ⚠️  Answered without long-range recall (retrieval unavailable)");
    }
    if outcome.attempts > 1 {
        eprintln!("  (reply needed {} attempts)", outcome.attempts);
    }
    Ok(())
}
