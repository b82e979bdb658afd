//! Supervisor — the stage machine that drives the six agents.
//!
//! Stages run strictly in order; after each one the supervisor consults
//! the state to pick the next action. Each stage runs under its soft
//! deadline and the session's cancellation token; a timed-out stage is a
//! non-fatal error with an empty slot, a cancelled stage terminates the
//! session. Only `CONTRACT_VIOLATION` aborts unconditionally.

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::PipelineContext;
use crate::agents;
use crate::db::repository;
use crate::error::{ErrorKind, PipelineError, StageError};
use crate::models::enums::{OverallStatus, Recommendation, SessionStatus, Stage, StageOutcome};
use crate::models::session::{DivergenceRecord, RunRequest, SessionRecord};
use crate::models::verdict::Verdict;
use crate::progress::ProgressPayload;
use crate::state::PipelineState;

/// Stages the supervisor schedules, in order. `End` is not an agent.
const PIPELINE_STAGES: [Stage; 6] = [
    Stage::Extraction,
    Stage::Quantitative,
    Stage::Compliance,
    Stage::DivergenceGuard,
    Stage::Reconciliation,
    Stage::Drafting,
];

enum StageResult {
    Completed,
    Failed(StageError),
    TimedOut,
    Cancelled,
}

/// Drive one session from `PROCESSING` to a terminal state.
pub async fn run_session(
    ctx: &PipelineContext,
    request: &RunRequest,
    cancel: CancellationToken,
) -> Result<SessionRecord, PipelineError> {
    let started_at = Utc::now();
    let mut state = PipelineState::new(&request.session_id, &request.tenant_id);
    state.po_document_id = request.po_document_id.clone();
    state.grn_document_id = request.grn_document_id.clone();
    state.invoice_document_id = request.invoice_document_id.clone();

    tracing::info!(
        session_id = %state.session_id,
        tenant_id = %state.tenant_id,
        "reconciliation workflow starting"
    );
    ctx.bus.publish(
        &state.session_id,
        ProgressPayload::WorkflowStarted { total_stages: PIPELINE_STAGES.len() },
    );

    let mut cancelled = false;
    loop {
        let stage = state.next_action;
        if stage == Stage::End {
            break;
        }
        state.current_stage = stage;

        let next = match run_stage(ctx, &mut state, stage, &cancel).await {
            StageResult::Completed => route_after(&mut state, stage),
            StageResult::Failed(error) => {
                let fatal = error.fatal;
                ctx.bus.publish(
                    &state.session_id,
                    ProgressPayload::WorkflowError {
                        stage,
                        message: error.message.clone(),
                    },
                );
                state.push_error(error);
                if fatal {
                    Stage::End
                } else {
                    route_after(&mut state, stage)
                }
            }
            StageResult::TimedOut => {
                state.push_error(StageError::non_fatal(
                    stage,
                    ErrorKind::Timeout,
                    format!(
                        "stage exceeded its {}s deadline",
                        ctx.config.stage_deadline(stage).as_secs()
                    ),
                ));
                route_after(&mut state, stage)
            }
            StageResult::Cancelled => {
                cancelled = true;
                state.push_error(StageError::non_fatal(stage, ErrorKind::Cancelled, "session cancelled"));
                Stage::End
            }
        };
        state.next_action = next;
    }

    finalize(ctx, state, cancelled, started_at)
}

async fn run_stage(
    ctx: &PipelineContext,
    state: &mut PipelineState,
    stage: Stage,
    cancel: &CancellationToken,
) -> StageResult {
    let session_id = state.session_id.clone();
    ctx.bus.publish(
        &session_id,
        ProgressPayload::AgentStarted {
            stage,
            message: start_message(stage).to_string(),
        },
    );

    let started = Utc::now();
    let deadline = ctx.config.stage_deadline(stage);

    let result = tokio::select! {
        _ = cancel.cancelled() => StageResult::Cancelled,
        outcome = tokio::time::timeout(deadline, dispatch(ctx, state, stage)) => match outcome {
            Err(_) => StageResult::TimedOut,
            Ok(Ok(())) => StageResult::Completed,
            Ok(Err(stage_error)) => StageResult::Failed(stage_error),
        },
    };

    let finished = Utc::now();
    let outcome = match &result {
        StageResult::Completed => StageOutcome::Completed,
        StageResult::Failed(_) => StageOutcome::Failed,
        StageResult::TimedOut => StageOutcome::Timeout,
        StageResult::Cancelled => StageOutcome::Cancelled,
    };
    state.push_trace(stage, started, finished, outcome);

    if matches!(result, StageResult::Completed) {
        let duration_ms = (finished - started).num_milliseconds().max(0) as u64;
        ctx.bus.publish(
            &session_id,
            ProgressPayload::AgentCompleted { stage, duration_ms },
        );
    }

    result
}

async fn dispatch(
    ctx: &PipelineContext,
    state: &mut PipelineState,
    stage: Stage,
) -> Result<(), StageError> {
    match stage {
        Stage::Extraction => agents::extraction::run(ctx, state).await,
        Stage::Quantitative => agents::quantitative::run(ctx, state).await,
        Stage::Compliance => agents::compliance::run(ctx, state).await,
        Stage::DivergenceGuard => agents::divergence::run(ctx, state).await,
        Stage::Reconciliation => agents::reconciliation::run(ctx, state).await,
        Stage::Drafting => agents::drafting::run(ctx, state).await,
        Stage::End => Ok(()),
    }
}

fn start_message(stage: Stage) -> &'static str {
    match stage {
        Stage::Extraction => "Extracting and citing line items from all documents",
        Stage::Quantitative => "Recomputing line and document arithmetic",
        Stage::Compliance => "Evaluating compliance rules",
        Stage::DivergenceGuard => "Running dual-stream divergence analysis",
        Stage::Reconciliation => "Building the three-way match",
        Stage::Drafting => "Composing the audit workpaper",
        Stage::End => "",
    }
}

/// The routing table: decide the next action from the state after `stage`.
fn route_after(state: &mut PipelineState, stage: Stage) -> Stage {
    match stage {
        Stage::Extraction => {
            let present = state
                .extracted
                .as_ref()
                .map(|e| e.present_count())
                .unwrap_or(0);
            match present {
                0 => {
                    state.push_error(StageError::fatal(
                        Stage::Extraction,
                        ErrorKind::ParseError,
                        "no document could be extracted",
                    ));
                    Stage::End
                }
                1 | 2 => {
                    state.push_error(StageError::non_fatal(
                        Stage::Extraction,
                        ErrorKind::UnavailableInput,
                        format!("only {present} of 3 documents extracted; continuing degraded"),
                    ));
                    Stage::Quantitative
                }
                _ => Stage::Quantitative,
            }
        }
        // A failed quantitative stage skips compliance: its rules lean on
        // arithmetic results that do not exist.
        Stage::Quantitative => {
            if state.quantitative.is_some() {
                Stage::Compliance
            } else {
                Stage::DivergenceGuard
            }
        }
        Stage::Compliance => Stage::DivergenceGuard,
        Stage::DivergenceGuard => Stage::Reconciliation,
        Stage::Reconciliation => Stage::Drafting,
        Stage::Drafting | Stage::End => Stage::End,
    }
}

fn finalize(
    ctx: &PipelineContext,
    mut state: PipelineState,
    cancelled: bool,
    started_at: chrono::DateTime<Utc>,
) -> Result<SessionRecord, PipelineError> {
    let status = if cancelled {
        SessionStatus::Cancelled
    } else if state.has_fatal_error() {
        SessionStatus::Failed
    } else if state.divergence_alert() {
        // The guard's outcome overrides everything else.
        SessionStatus::DivergenceAlert
    } else {
        match &state.verdict {
            Some(v) => match v.overall_status {
                OverallStatus::FullMatch => SessionStatus::Matched,
                OverallStatus::PartialMatch | OverallStatus::Mismatch => {
                    SessionStatus::DiscrepancyFound
                }
                OverallStatus::Exception => SessionStatus::Exception,
                OverallStatus::DivergenceAlert => SessionStatus::DivergenceAlert,
            },
            None => SessionStatus::Exception,
        }
    };

    // Outside FAILED/CANCELLED the record always carries a recommendation;
    // a session that lost its verdict to a timeout gets an exception one.
    if state.verdict.is_none() && !matches!(status, SessionStatus::Failed | SessionStatus::Cancelled)
    {
        state.verdict = Some(Verdict {
            overall_status: OverallStatus::Exception,
            confidence: 0.0,
            line_item_matches: vec![],
            discrepancy_summary: vec!["no verdict produced; manual review required".into()],
            recommendation: Recommendation::Escalate,
        });
    }

    persist_divergence(ctx, &state);
    persist_workpaper(ctx, &state);

    let verdict_summary = state
        .verdict
        .as_ref()
        .map(|v| v.overall_status.as_str().to_string())
        .unwrap_or_else(|| "none".to_string());

    ctx.bus.publish(
        &state.session_id,
        ProgressPayload::WorkflowComplete {
            status,
            verdict_summary,
        },
    );

    tracing::info!(
        session_id = %state.session_id,
        status = status.as_str(),
        errors = state.errors.len(),
        "reconciliation workflow complete"
    );

    Ok(SessionRecord {
        id: state.session_id,
        tenant_id: state.tenant_id,
        po_document_id: state.po_document_id,
        grn_document_id: state.grn_document_id,
        invoice_document_id: state.invoice_document_id,
        status,
        verdict: if matches!(status, SessionStatus::Failed | SessionStatus::Cancelled) {
            None
        } else {
            state.verdict
        },
        agent_trace: state.agent_trace,
        errors: state.errors,
        started_at,
        completed_at: Some(Utc::now()),
    })
}

fn persist_divergence(ctx: &PipelineContext, state: &PipelineState) {
    let (Some(db), Some(metrics)) = (&ctx.db, &state.divergence) else {
        return;
    };
    let record = DivergenceRecord {
        session_id: state.session_id.clone(),
        tenant_id: state.tenant_id.clone(),
        primary_summary: metrics.primary_digest.clone(),
        shadow_summary: metrics.shadow_digest.clone(),
        similarity: metrics.similarity,
        threshold_used: metrics.threshold,
        alert_triggered: metrics.alert_triggered,
        perturbation_summary: metrics.perturbation_summary.clone(),
        created_at: Utc::now(),
    };
    let conn = db.lock().expect("db lock poisoned");
    if let Err(e) = repository::insert_divergence_record(&conn, &record) {
        tracing::warn!(session_id = %state.session_id, error = %e, "divergence record not persisted");
    }
}

fn persist_workpaper(ctx: &PipelineContext, state: &PipelineState) {
    let (Some(db), Some(workpaper)) = (&ctx.db, &state.workpaper) else {
        return;
    };
    let conn = db.lock().expect("db lock poisoned");
    if let Err(e) = repository::upsert_workpaper(&conn, workpaper) {
        tracing::warn!(session_id = %state.session_id, error = %e, "workpaper not persisted");
    }
}
