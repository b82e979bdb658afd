//! Citation binder — attaches spatial evidence to extracted values.
//!
//! For every scalar the extraction agent pulls out of a document, the
//! binder searches the retrieved chunks for the literal and adopts the
//! containing chunk's `(page, bbox)`. A value no chunk contains stays
//! uncited and is carried forward as an `UNRESOLVED_CITATION` warning, not
//! an error — the verdict marks it instead of inventing evidence.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::document::{Citation, ScoredChunk};

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// A warning for a value without spatial evidence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedValue {
    pub field: String,
    pub value: String,
}

fn normalize(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").to_lowercase()
}

/// Find the citation of the best-scoring chunk containing `literal`.
/// Trivially short literals never bind — a one-character "match" is noise.
pub fn bind_literal(literal: &str, chunks: &[ScoredChunk]) -> Option<Citation> {
    let needle = normalize(literal);
    if needle.len() < 2 {
        return None;
    }
    let mut best: Option<(f64, Citation)> = None;
    for chunk in chunks {
        if normalize(&chunk.text).contains(&needle) {
            let better = best.as_ref().map(|(s, _)| chunk.score > *s).unwrap_or(true);
            if better {
                best = Some((chunk.score, chunk.citation));
            }
        }
    }
    best.map(|(_, citation)| citation)
}

/// Bind a numeric value: the literal may appear with or without trailing
/// zeros ("500.00" vs "500.0" vs "500"), so all plain renderings are tried,
/// longest first.
pub fn bind_numeric(value: &str, chunks: &[ScoredChunk]) -> Option<Citation> {
    for candidate in numeric_renderings(value) {
        if let Some(citation) = bind_literal(&candidate, chunks) {
            return Some(citation);
        }
    }
    None
}

fn numeric_renderings(value: &str) -> Vec<String> {
    let trimmed = value.trim().to_string();
    let mut out = vec![trimmed.clone()];
    if trimmed.contains('.') {
        let mut shorter = trimmed.clone();
        while shorter.ends_with('0') {
            shorter.pop();
            if !shorter.ends_with('.') {
                out.push(shorter.clone());
            }
        }
        if shorter.ends_with('.') {
            shorter.pop();
            out.push(shorter);
        }
    }
    out
}

/// Bind one named field, recording an unresolved warning on a miss.
pub fn bind_field(
    field: &str,
    value: &str,
    numeric: bool,
    chunks: &[ScoredChunk],
    unresolved: &mut Vec<UnresolvedValue>,
) -> Option<Citation> {
    let citation = if numeric {
        bind_numeric(value, chunks)
    } else {
        bind_literal(value, chunks)
    };
    if citation.is_none() {
        tracing::warn!(field, value, "no chunk contains literal, citation unresolved");
        unresolved.push(UnresolvedValue {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
    citation
}
