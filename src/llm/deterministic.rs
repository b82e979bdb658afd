//! Terminal fallback provider.
//!
//! Always answers. Completions are rule-based: financial patterns scraped
//! from the prompt into a schema-shaped neutral JSON. Reasoning vectors are
//! derived from a cryptographic hash of the prompt, so the same prompt
//! always yields the same vector. This keeps the pipeline completing
//! through upstream outages; the router marks anything served from here as
//! degraded.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};

use super::provider::{CompletionRequest, LlmProvider, ProviderError};

/// Default reasoning-vector dimension for the deterministic provider.
pub const DEFAULT_VECTOR_DIM: usize = 64;

static AMOUNT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$[\d,]+\.?\d*|\b\d+\.\d{2}\b").unwrap()
});

static DATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{4}-\d{2}-\d{2}\b|\b\d{1,2}[/-]\d{1,2}[/-]\d{2,4}\b").unwrap()
});

static DOC_NUMBER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:Invoice|Order|PO|GRN|INV)\b[-#\s]*([A-Z0-9][A-Z0-9-]{3,19})").unwrap()
});

pub struct DeterministicProvider {
    dimension: usize,
}

impl DeterministicProvider {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for DeterministicProvider {
    fn default() -> Self {
        Self::new(DEFAULT_VECTOR_DIM)
    }
}

#[async_trait]
impl LlmProvider for DeterministicProvider {
    fn name(&self) -> &str {
        "deterministic"
    }

    fn is_terminal(&self) -> bool {
        true
    }

    fn vector_dimension(&self) -> usize {
        self.dimension
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<String, ProviderError> {
        if !req.json_mode {
            return Ok(
                "Automated analysis narrative is unavailable; the deterministic \
                 fallback was engaged. Findings below were computed without model \
                 assistance and require manual review."
                    .to_string(),
            );
        }
        Ok(rule_based_json(&req.prompt))
    }

    async fn reasoning_vector(&self, prompt: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(hash_vector(prompt, self.dimension))
    }
}

/// Schema-shaped neutral JSON with whatever the patterns can scrape.
fn rule_based_json(prompt: &str) -> String {
    let amounts: Vec<&str> = AMOUNT_PATTERN.find_iter(prompt).map(|m| m.as_str()).collect();
    let date = DATE_PATTERN.find(prompt).map(|m| m.as_str().to_string());
    let doc_number = DOC_NUMBER_PATTERN
        .captures(prompt)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    let grand_total = amounts
        .last()
        .map(|s| s.trim_start_matches('$').replace(',', ""))
        .unwrap_or_else(|| "0".to_string());

    let payload = serde_json::json!({
        "vendor_name": "",
        "document_number": doc_number.unwrap_or_default(),
        "document_date": date.unwrap_or_default(),
        "currency": "USD",
        "line_items": [],
        "subtotal": "0",
        "tax": "0",
        "grand_total": grand_total,
        "risk_score": 5.0,
        "flags": [],
        "policy_violations": [],
        "extraction_method": "rule_based_fallback",
    });

    tracing::warn!(
        amounts_found = amounts.len(),
        "deterministic provider served a rule-based completion"
    );
    payload.to_string()
}

/// Derive a unit vector from a SHA-256 stream over the prompt.
/// Same prompt, same dimension, same vector.
fn hash_vector(prompt: &str, dimension: usize) -> Vec<f32> {
    let seed = Sha256::digest(prompt.as_bytes());

    let mut values = Vec::with_capacity(dimension);
    let mut counter: u64 = 0;
    while values.len() < dimension {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(counter.to_be_bytes());
        let block = hasher.finalize();
        for &byte in block.iter() {
            if values.len() == dimension {
                break;
            }
            values.push((byte as f32 - 127.5) / 127.5);
        }
        counter += 1;
    }

    let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut values {
            *v /= norm;
        }
    } else {
        values[0] = 1.0;
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_answers_json_mode() {
        let provider = DeterministicProvider::default();
        let req = CompletionRequest::json("Invoice INV-20441 total 500.00 due 2026-05-01", "sys");
        let out = provider.complete(&req).await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["extraction_method"], "rule_based_fallback");
        assert_eq!(v["document_number"], "INV-20441");
        assert_eq!(v["grand_total"], "500.00");
    }

    #[tokio::test]
    async fn text_mode_returns_neutral_narrative() {
        let provider = DeterministicProvider::default();
        let out = provider
            .complete(&CompletionRequest::text("write a workpaper", "sys"))
            .await
            .unwrap();
        assert!(out.contains("deterministic"));
    }

    #[tokio::test]
    async fn same_prompt_same_vector() {
        let provider = DeterministicProvider::default();
        let a = provider.reasoning_vector("identical prompt").await.unwrap();
        let b = provider.reasoning_vector("identical prompt").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), DEFAULT_VECTOR_DIM);
    }

    #[tokio::test]
    async fn different_prompts_different_vectors() {
        let provider = DeterministicProvider::default();
        let a = provider.reasoning_vector("prompt A").await.unwrap();
        let b = provider.reasoning_vector("prompt B").await.unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn hash_vector_is_unit_length() {
        let v = hash_vector("any prompt", 64);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4, "norm = {norm}");
    }

    #[test]
    fn hash_vector_respects_dimension() {
        assert_eq!(hash_vector("p", 768).len(), 768);
        assert_eq!(hash_vector("p", 64).len(), 64);
    }

    #[test]
    fn terminal_flag_set() {
        assert!(DeterministicProvider::default().is_terminal());
    }
}
