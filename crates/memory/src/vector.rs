//! Vector similarity and ranking utilities.
//!
//! Pure-Rust implementations of:
//! - Cosine similarity
//! - Filtered top-k ranking shared by every store backend

use canopy_core::memory::{ScoredEntry, VectorEntry, VectorQuery};
use std::cmp::Ordering;

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if either vector is zero-length or empty.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// Result order: descending score, ties broken by newer timestamp first.
pub fn compare_scored(a: &ScoredEntry, b: &ScoredEntry) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.entry.timestamp.cmp(&a.entry.timestamp))
}

/// Rank candidates against a query.
///
/// Applies the query's scope and temporal cutoff, drops entries scoring
/// below `min_score`, and returns at most `top_k` results in
/// [`compare_scored`] order.
pub fn rank<'a, I>(candidates: I, query: &VectorQuery) -> Vec<ScoredEntry>
where
    I: IntoIterator<Item = &'a VectorEntry>,
{
    if query.top_k == 0 {
        return Vec::new();
    }

    let mut scored: Vec<ScoredEntry> = candidates
        .into_iter()
        .filter(|entry| query.admits(entry))
        .filter_map(|entry| {
            let score = cosine_similarity(&entry.embedding, &query.embedding);
            (score >= query.min_score).then(|| ScoredEntry {
                entry: entry.clone(),
                score,
            })
        })
        .collect();

    scored.sort_by(compare_scored);
    scored.truncate(query.top_k);
    scored
}
