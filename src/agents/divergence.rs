//! Divergence guard — dual-stream hallucination detection.
//!
//! The primary stream reasons over the extracted data as-is; the shadow
//! stream reasons over the same data with a reproducible fraction of its
//! monetary literals perturbed by ±5–10%. If the reasoning vectors of the
//! two streams stay too similar, the model did not engage with the numbers
//! it was shown — its conclusions about them cannot be trusted, and the
//! session escalates to a human.
//!
//! The perturbation RNG is seeded from the session id, so a re-run of the
//! same session perturbs identically and reproduces the same similarity.

use std::sync::LazyLock;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::{ErrorKind, StageError};
use crate::models::enums::{DocumentKind, Stage};
use crate::models::extracted::ExtractedData;
use crate::models::verdict::DivergenceMetrics;
use crate::pipeline::PipelineContext;
use crate::progress::ProgressPayload;
use crate::state::PipelineState;

/// Monetary literals eligible for perturbation.
static MONEY_LITERAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d+\.\d{2}\b").unwrap());

/// Perturbation factors, drawn uniformly.
const FACTORS: [f64; 4] = [-0.10, -0.05, 0.05, 0.10];

const ANALYSIS_SYSTEM: &str = "You are performing a financial reconciliation analysis. \
Respond with valid JSON only.";

pub async fn run(ctx: &PipelineContext, state: &mut PipelineState) -> Result<(), StageError> {
    let Some(extracted) = state.extracted.as_ref() else {
        state.push_error(StageError::non_fatal(
            Stage::DivergenceGuard,
            ErrorKind::UnavailableInput,
            "no extracted data; divergence guard skipped",
        ));
        return Ok(());
    };

    let session_id = state.session_id.clone();
    let tenant_id = state.tenant_id.clone();
    let threshold = ctx.thresholds.threshold(&tenant_id);

    let primary_context = build_context(extracted);
    let (shadow_context, perturbations) = perturb_context(
        &primary_context,
        &session_id,
        ctx.config.divergence.perturbation_probability,
    );

    tracing::info!(
        session_id = %session_id,
        threshold,
        perturbations = perturbations.len(),
        "divergence guard starting"
    );

    let primary = ctx
        .router
        .reasoning_vector(&analysis_prompt(&primary_context))
        .await
        .map_err(|e| {
            StageError::non_fatal(Stage::DivergenceGuard, ErrorKind::UpstreamUnavailable, e.to_string())
        })?;

    // Identical contexts must yield similarity 1.0 — reuse the primary
    // vector instead of burning a second call on the same prompt.
    let shadow = if shadow_context == primary_context {
        primary.clone()
    } else {
        ctx.router
            .reasoning_vector(&analysis_prompt(&shadow_context))
            .await
            .map_err(|e| {
                StageError::non_fatal(Stage::DivergenceGuard, ErrorKind::UpstreamUnavailable, e.to_string())
            })?
    };

    let degraded = primary.degraded || shadow.degraded;
    if degraded {
        state.push_error(StageError::non_fatal(
            Stage::DivergenceGuard,
            ErrorKind::UpstreamUnavailable,
            "reasoning vectors served by deterministic fallback",
        ));
    }

    let perturbation_summary = if perturbations.is_empty() {
        "no perturbation applied".to_string()
    } else {
        perturbations.join("; ")
    };

    let mut reason = None;
    let mut alert_triggered;
    let similarity = match cosine(&primary.value, &shadow.value) {
        Some(s) if s.is_finite() => {
            alert_triggered = s < threshold;
            s
        }
        _ => {
            // Zero-norm vector, NaN, or dimension mismatch: the metric is
            // meaningless, which is itself an alert condition.
            state.push_error(StageError::non_fatal(
                Stage::DivergenceGuard,
                ErrorKind::VectorDegenerate,
                "reasoning vector unusable (zero norm, NaN or dimension mismatch)",
            ));
            reason = Some("VECTOR_DEGENERATE".to_string());
            alert_triggered = true;
            0.0
        }
    };

    // Hash-derived vectors do not witness model reasoning; a similarity
    // shortfall between them is noise unless the vectors were degenerate.
    if alert_triggered
        && degraded
        && reason.is_none()
        && ctx.config.divergence.suppress_alert_when_degraded
    {
        tracing::warn!(session_id = %session_id, similarity, "alert suppressed in degraded mode");
        reason = Some("SUPPRESSED_DEGRADED".to_string());
        alert_triggered = false;
    }

    if alert_triggered {
        ctx.bus.publish(
            &session_id,
            ProgressPayload::DivergenceAlert {
                similarity,
                threshold,
                perturbation_summary: perturbation_summary.clone(),
            },
        );
    } else {
        ctx.bus
            .publish(&session_id, ProgressPayload::DivergenceClear { similarity });
    }

    tracing::info!(
        session_id = %session_id,
        similarity,
        alert = alert_triggered,
        degraded,
        "divergence guard complete"
    );

    state.divergence = Some(DivergenceMetrics {
        similarity,
        threshold,
        alert_triggered,
        degraded,
        reason,
        perturbation_summary,
        primary_digest: digest(&primary_context),
        shadow_digest: digest(&shadow_context),
    });
    Ok(())
}

/// Canonical text rendering of the extracted data, identical across runs.
pub fn build_context(extracted: &ExtractedData) -> String {
    let mut parts = Vec::new();
    for kind in DocumentKind::ALL {
        let Some(doc) = extracted.get(kind) else { continue };
        parts.push(format!("=== {} ===", kind.as_str().to_uppercase()));
        parts.push(format!(
            "vendor: {} | number: {} | date: {}",
            doc.vendor_name, doc.document_number, doc.document_date
        ));
        for item in doc.line_items.iter().take(10) {
            parts.push(format!(
                "  item: {} | qty: {} | price: {} | total: {}",
                item.description, item.quantity, item.unit_price, item.total
            ));
        }
        parts.push(format!(
            "  subtotal: {} | tax: {} | total: {}",
            doc.subtotal, doc.tax, doc.grand_total
        ));
    }
    parts.join("\n")
}

fn analysis_prompt(context: &str) -> String {
    format!(
        "Based on the following document data, determine whether the three \
         documents agree.\n\nData:\n{context}\n\n\
         Respond with JSON: {{\"verdict\": \"match|mismatch|partial_match\", \
         \"confidence\": 0.0, \"rationale\": \"\", \"anomalies\": []}}"
    )
}

/// Derive the shadow context: each monetary literal is independently
/// perturbed with probability `p` by a factor drawn from ±5%/±10%, rounded
/// to two places. Returns the perturbation log.
pub fn perturb_context(context: &str, session_id: &str, p: f64) -> (String, Vec<String>) {
    let mut rng = seeded_rng(session_id);
    let mut log = Vec::new();

    let perturbed = MONEY_LITERAL
        .replace_all(context, |caps: &regex::Captures<'_>| {
            let original = caps.get(0).unwrap().as_str();
            if rng.gen::<f64>() >= p {
                return original.to_string();
            }
            let Ok(value) = original.parse::<f64>() else {
                return original.to_string();
            };
            let factor = FACTORS[rng.gen_range(0..FACTORS.len())];
            let shifted = format!("{:.2}", value * (1.0 + factor));
            log.push(format!("{original} -> {shifted}"));
            shifted
        })
        .into_owned();

    (perturbed, log)
}

fn seeded_rng(session_id: &str) -> StdRng {
    let digest = Sha256::digest(session_id.as_bytes());
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&digest);
    StdRng::from_seed(seed)
}

/// Cosine similarity; `None` for zero-norm or mismatched dimensions.
pub fn cosine(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x as f64 * y as f64;
        norm_a += x as f64 * x as f64;
        norm_b += y as f64 * y as f64;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

fn digest(text: &str) -> String {
    let hash = Sha256::digest(text.as_bytes());
    hash.iter().take(8).map(|b| format!("{b:02x}")).collect()
}
