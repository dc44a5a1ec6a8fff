//! `canopy say|context`: message and context commands.

use super::{load_config, open_engine, parse_node};
use canopy_agent::IndexStatus;
use canopy_core::message::{Role, Timestamp};
use canopy_core::payload::{ContextPayload, ContextWarning, PromptMessage};
use std::path::Path;

pub async fn say(
    config_path: Option<&Path>,
    node: &str,
    role: Role,
    text: &str,
    at: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let engine = open_engine(&config).await?;

    let receipt = engine
        .append_message(&parse_node(node), role, text, at.map(Timestamp))
        .await?;
    engine.save()?;

    println!("{} {}", receipt.message.id, receipt.message.timestamp);
    if let IndexStatus::Deferred { reason } = &receipt.index_status {
        eprintln!("  ⚠️  Not indexed yet ({reason}); run `canopy reindex` later");
    }
    Ok(())
}

pub async fn context(
    config_path: Option<&Path>,
    node: &str,
    at: Option<u64>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let engine = open_engine(&config).await?;

    let payload = engine
        .build_context(&parse_node(node), at.map(Timestamp))
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print!("{}", render(&payload));
    }
    Ok(())
}

/// Human-readable rendering of a payload.
pub fn render(payload: &ContextPayload) -> String {
    let mut out = String::new();
    for warning in &payload.warnings {
        match warning {
            ContextWarning::RetrievalUnavailable { reason } => {
                out.push_str(&format!("  ⚠️  Retrieval unavailable: {reason}\n"));
            }
        }
    }
    for entry in &payload.entries {
        let prompt = PromptMessage::from(entry);
        out.push_str(&format!(
            "  {:>9} {:>5}  {}\n",
            entry.role.as_str(),
            entry.timestamp.to_string(),
            prompt.render()
        ));
    }
    let meta = &payload.metadata;
    out.push_str(&format!(
        "  ({} inherited, {} recalled, {} duplicates dropped, ~{} tokens)\n",
        meta.buffer_entries, meta.retrieved_entries, meta.duplicates_dropped, meta.estimated_tokens
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::message::{Message, NodeId};
    use canopy_core::payload::{ContextEntry, PayloadMetadata, Provenance};

    #[test]
    fn render_marks_recalled_entries_and_warnings() {
        let inherited = Message::new(NodeId::from("b"), Role::User, "current", Timestamp(4));
        let recalled = Message::new(NodeId::from("a"), Role::User, "long ago", Timestamp(1));
        let mut recalled = ContextEntry::from_buffer(&recalled, vec!["Trip".into()]);
        recalled.provenance = Provenance::Retrieval;

        let payload = ContextPayload {
            node_id: NodeId::from("b"),
            cutoff: Timestamp(5),
            entries: vec![
                ContextEntry::from_buffer(&inherited, vec!["Trip".into(), "Day 2".into()]),
                recalled,
            ],
            warnings: vec![ContextWarning::RetrievalUnavailable {
                reason: "offline".into(),
            }],
            metadata: PayloadMetadata {
                buffer_entries: 1,
                retrieved_entries: 1,
                ..Default::default()
            },
        };

        let text = render(&payload);
        assert!(text.contains("Retrieval unavailable: offline"));
        assert!(text.contains("[Recalled from Trip] long ago"));
        assert!(text.contains("1 inherited, 1 recalled"));
    }
}
