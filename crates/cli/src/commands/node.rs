//! `canopy new|sub|tree|path`: forest structure commands.

use super::{load_config, open_engine, parse_node};
use canopy_forest::NodeOptions;
use std::path::Path;

pub async fn create(
    config_path: Option<&Path>,
    parent: Option<&str>,
    title: &str,
    max_turns: Option<usize>,
    context_turns: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let engine = open_engine(&config).await?;

    let options = NodeOptions {
        max_turns,
        context_turns,
    };
    let parent = parent.map(parse_node);
    let node = engine.create_node(title, parent.as_ref(), options)?;
    engine.save()?;

    println!("{}", node.id);
    if let Some(parent) = &node.parent_id {
        eprintln!("  Created subchat '{}' under {parent}", node.title);
    } else {
        eprintln!("  Created conversation '{}'", node.title);
    }
    Ok(())
}

pub async fn tree(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let engine = open_engine(&config).await?;

    if engine.forest().is_empty() {
        println!("  (no conversations yet, start one with `canopy new <title>`)");
        return Ok(());
    }
    print!("{}", engine.forest().render_tree());
    Ok(())
}

pub async fn path(config_path: Option<&Path>, node: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let engine = open_engine(&config).await?;

    let path = engine.get_path(&parse_node(node))?;
    println!("{}", path.join(" / "));
    Ok(())
}
