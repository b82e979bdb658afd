//! Token-set description similarity for cross-document entity resolution.
//!
//! Scores are in `[0, 100]`. The comparison is multiset-based so word
//! reordering ("bolts steel M8" vs "steel M8 bolts") scores 100, while
//! partial overlap degrades smoothly. An exact part-number match overrides
//! the description score entirely.

use std::collections::HashMap;

/// Minimum score at which two items are considered the same entity.
pub const LINK_THRESHOLD: f64 = 70.0;
/// Minimum score for a triple to count as a full description match.
pub const FULL_MATCH_THRESHOLD: f64 = 85.0;

/// Lower-case, strip punctuation, split on whitespace.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn counts(tokens: &[String]) -> HashMap<&str, usize> {
    let mut map: HashMap<&str, usize> = HashMap::new();
    for t in tokens {
        *map.entry(t.as_str()).or_default() += 1;
    }
    map
}

/// Multiset token similarity: `100 * 2|A ∩ B| / (|A| + |B|)`, where the
/// intersection is multiplicity-aware.
pub fn token_set_score(a: &str, b: &str) -> f64 {
    let ta = tokenize(a);
    let tb = tokenize(b);
    if ta.is_empty() && tb.is_empty() {
        return 100.0;
    }
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let ca = counts(&ta);
    let cb = counts(&tb);
    let mut shared = 0usize;
    for (token, n) in &ca {
        if let Some(m) = cb.get(token) {
            shared += (*n).min(*m);
        }
    }
    100.0 * (2 * shared) as f64 / (ta.len() + tb.len()) as f64
}

/// Score two line items: token-set similarity over descriptions, overridden
/// to 100 when both carry the same non-empty part number
/// (case-insensitively).
pub fn match_score(
    a_desc: &str,
    a_part: Option<&str>,
    b_desc: &str,
    b_part: Option<&str>,
) -> f64 {
    if let (Some(pa), Some(pb)) = (a_part, b_part) {
        let pa = pa.trim();
        let pb = pb.trim();
        if !pa.is_empty() && pa.eq_ignore_ascii_case(pb) {
            return 100.0;
        }
    }
    token_set_score(a_desc, b_desc)
}

/// A resolved counterparty match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedMatch {
    pub index: usize,
    pub score: f64,
}

/// Find the best counterparty item for `(desc, part)` among `candidates`,
/// skipping indices already claimed. Ties on score prefer the earlier index,
/// so repeated runs produce a stable assignment.
pub fn best_match<'a, I>(
    desc: &str,
    part: Option<&str>,
    candidates: I,
    taken: &[bool],
) -> Option<ResolvedMatch>
where
    I: IntoIterator<Item = (usize, &'a str, Option<&'a str>)>,
{
    let mut best: Option<ResolvedMatch> = None;
    for (idx, cand_desc, cand_part) in candidates {
        if taken.get(idx).copied().unwrap_or(false) {
            continue;
        }
        let score = match_score(desc, part, cand_desc, cand_part);
        if score < LINK_THRESHOLD {
            continue;
        }
        let better = match best {
            None => true,
            Some(b) => score > b.score, // equal score keeps the earlier index
        };
        if better {
            best = Some(ResolvedMatch { index: idx, score });
        }
    }
    best
}
