//! Drafting agent — workpaper assembly.
//!
//! The narrative prose is model-generated; every number and citation in
//! the workpaper is copied from earlier stages through the composer. With
//! the model unavailable the deterministic fallback supplies a neutral
//! narrative and the artifact is still produced.

use chrono::Utc;

use crate::error::{ErrorKind, StageError};
use crate::llm::CompletionRequest;
use crate::models::enums::Stage;
use crate::pipeline::PipelineContext;
use crate::state::PipelineState;
use crate::workpaper;

const SYSTEM_PROMPT: &str = "You are a senior audit partner drafting a formal audit workpaper. \
Use auditor-style language. Reference the Purchase Order, Goods Receipt Note and Invoice by name. \
Keep the narrative under 600 words. Do not state any amount that is not given to you.";

pub async fn run(ctx: &PipelineContext, state: &mut PipelineState) -> Result<(), StageError> {
    let Some(verdict) = state.verdict.clone() else {
        state.push_error(StageError::non_fatal(
            Stage::Drafting,
            ErrorKind::UnavailableInput,
            "no verdict; workpaper not drafted",
        ));
        return Ok(());
    };

    let narrative = match ctx
        .router
        .complete(&CompletionRequest::text(narrative_prompt(state, &verdict), SYSTEM_PROMPT))
        .await
    {
        Ok(routed) => {
            if routed.degraded {
                state.push_error(StageError::non_fatal(
                    Stage::Drafting,
                    ErrorKind::UpstreamUnavailable,
                    "narrative served by deterministic fallback",
                ));
            }
            routed.value
        }
        Err(e) => {
            state.push_error(StageError::non_fatal(
                Stage::Drafting,
                ErrorKind::UpstreamUnavailable,
                e.to_string(),
            ));
            "Automated narrative generation failed; findings below were computed \
             deterministically and require manual review."
                .to_string()
        }
    };

    let mut composed = workpaper::compose(
        &state.session_id,
        state.extracted.as_ref(),
        state.quantitative.as_ref(),
        state.compliance.as_ref(),
        state.divergence.as_ref(),
        &verdict,
        &narrative,
        Utc::now(),
    );
    composed.id = uuid::Uuid::new_v4().to_string();

    tracing::info!(
        session_id = %state.session_id,
        citations = composed.citations.len(),
        rows = composed.line_item_table.len(),
        "workpaper composed"
    );

    state.workpaper = Some(composed);
    Ok(())
}

/// The narrative prompt carries only already-verified findings; the model
/// writes prose around them and contributes no numbers of its own.
fn narrative_prompt(state: &PipelineState, verdict: &crate::models::verdict::Verdict) -> String {
    let discrepancies = if verdict.discrepancy_summary.is_empty() {
        "none".to_string()
    } else {
        verdict.discrepancy_summary.join("; ")
    };
    let divergence_line = match &state.divergence {
        Some(d) if d.alert_triggered => format!(
            "divergence alert FIRED (similarity {:.4} below threshold {:.2}) — escalation is mandatory",
            d.similarity, d.threshold
        ),
        Some(d) => format!("divergence clear (similarity {:.4})", d.similarity),
        None => "divergence guard did not run".to_string(),
    };
    let risk = state
        .compliance
        .as_ref()
        .map(|c| format!("{:.1}", c.risk_score))
        .unwrap_or_else(|| "unknown".to_string());

    format!(
        "Draft the findings narrative of an audit workpaper for a three-way match.\n\n\
         Verdict: {}\n\
         Recommendation: {}\n\
         Confidence: {:.2}\n\
         Compliance risk score: {risk}/10\n\
         Divergence status: {divergence_line}\n\
         Key discrepancies: {discrepancies}\n\n\
         Cover: what was tested, what was found, and the materiality of the findings.",
        verdict.overall_status, verdict.recommendation, verdict.confidence
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::enums::{OverallStatus, Recommendation};
    use crate::models::verdict::{DivergenceMetrics, Verdict};

    fn verdict() -> Verdict {
        Verdict {
            overall_status: OverallStatus::Mismatch,
            confidence: 0.55,
            line_item_matches: vec![],
            discrepancy_summary: vec!["ordered 10, received 8".into()],
            recommendation: Recommendation::Hold,
        }
    }

    #[test]
    fn prompt_carries_verdict_and_discrepancies() {
        let state = PipelineState::new("s-1", "t-1");
        let prompt = narrative_prompt(&state, &verdict());
        assert!(prompt.contains("mismatch"));
        assert!(prompt.contains("hold"));
        assert!(prompt.contains("ordered 10, received 8"));
        assert!(prompt.contains("divergence guard did not run"));
    }

    #[test]
    fn prompt_reflects_divergence_alert() {
        let mut state = PipelineState::new("s-1", "t-1");
        state.divergence = Some(DivergenceMetrics {
            similarity: 0.40,
            threshold: 0.85,
            alert_triggered: true,
            degraded: false,
            reason: None,
            perturbation_summary: "500.00 -> 550.00".into(),
            primary_digest: String::new(),
            shadow_digest: String::new(),
        });
        let prompt = narrative_prompt(&state, &verdict());
        assert!(prompt.contains("alert FIRED"));
        assert!(prompt.contains("0.4000"));
    }
}
