//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token.
//! This approximation is accurate within ~10% for BPE tokenizers on
//! English text, which is all a retrieval budget needs.

use canopy_core::payload::ContextEntry;

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.len().div_ceil(4)
}

/// Estimate tokens for a single context entry including per-message overhead.
///
/// Each entry costs ~4 tokens of overhead for role name and delimiters.
/// Retrieved entries also carry their rendered source path.
pub fn estimate_entry_tokens(entry: &ContextEntry) -> usize {
    let overhead = 4;
    let path: usize = match entry.provenance {
        canopy_core::payload::Provenance::Buffer => 0,
        canopy_core::payload::Provenance::Retrieval => {
            estimate_tokens(&entry.source_node_path.join(" / ")) + 4
        }
    };
    overhead + path + estimate_tokens(&entry.text)
}

/// Estimate tokens for a slice of entries.
pub fn estimate_entries_tokens(entries: &[ContextEntry]) -> usize {
    entries.iter().map(estimate_entry_tokens).sum()
}
