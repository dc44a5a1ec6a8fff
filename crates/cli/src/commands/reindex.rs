//! `canopy reindex`: retry deferred indexing.

use super::{load_config, open_engine};
use std::path::Path;

pub async fn run(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let engine = open_engine(&config).await?;

    let report = engine.reindex_pending().await;
    if report.remaining == 0 {
        println!("✅ Indexed {} message(s), nothing pending", report.indexed);
    } else {
        println!(
            "⚠️  Indexed {} message(s), {} still pending",
            report.indexed, report.remaining
        );
    }
    Ok(())
}
