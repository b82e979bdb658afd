//! Shared pipeline state — one record per session, single writer per stage.
//!
//! The supervisor owns the record and hands each stage mutable access in
//! turn; once a stage has written its slot, downstream stages treat that
//! slot as read-only. There is no locking because stage execution is
//! structurally serialized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StageError;
use crate::models::document::Document;
use crate::models::enums::{Stage, StageOutcome};
use crate::models::extracted::ExtractedData;
use crate::models::verdict::{ComplianceReport, DivergenceMetrics, QuantitativeReport, Verdict};
use crate::workpaper::Workpaper;

/// One completed stage execution, appended in order, never reordered or
/// truncated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTraceEntry {
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: StageOutcome,
    pub duration_ms: u64,
}

/// The typed shared record all agents operate over.
#[derive(Debug, Clone)]
pub struct PipelineState {
    pub session_id: String,
    pub tenant_id: String,

    pub po_document_id: String,
    pub grn_document_id: String,
    pub invoice_document_id: String,

    // Fetched handles, filled by the extraction stage.
    pub po_document: Option<Document>,
    pub grn_document: Option<Document>,
    pub invoice_document: Option<Document>,

    // Per-stage slots. Each is written exactly once, by its own stage.
    pub extracted: Option<ExtractedData>,
    pub quantitative: Option<QuantitativeReport>,
    pub compliance: Option<ComplianceReport>,
    pub divergence: Option<DivergenceMetrics>,
    pub verdict: Option<Verdict>,
    pub workpaper: Option<Workpaper>,

    pub agent_trace: Vec<AgentTraceEntry>,
    pub errors: Vec<StageError>,

    pub current_stage: Stage,
    pub next_action: Stage,
}

impl PipelineState {
    pub fn new(session_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            tenant_id: tenant_id.into(),
            po_document_id: String::new(),
            grn_document_id: String::new(),
            invoice_document_id: String::new(),
            po_document: None,
            grn_document: None,
            invoice_document: None,
            extracted: None,
            quantitative: None,
            compliance: None,
            divergence: None,
            verdict: None,
            workpaper: None,
            agent_trace: Vec::new(),
            errors: Vec::new(),
            current_stage: Stage::Extraction,
            next_action: Stage::Extraction,
        }
    }

    pub fn push_trace(
        &mut self,
        stage: Stage,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcome: StageOutcome,
    ) {
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        self.agent_trace.push(AgentTraceEntry {
            stage,
            started_at,
            finished_at,
            outcome,
            duration_ms,
        });
    }

    pub fn push_error(&mut self, error: StageError) {
        tracing::warn!(
            session_id = %self.session_id,
            stage = error.stage.as_str(),
            kind = error.kind.as_str(),
            fatal = error.fatal,
            "stage error recorded"
        );
        self.errors.push(error);
    }

    pub fn has_fatal_error(&self) -> bool {
        self.errors.iter().any(|e| e.fatal)
    }

    /// True when the divergence guard fired (and the alert was not
    /// suppressed for degraded vectors).
    pub fn divergence_alert(&self) -> bool {
        self.divergence.as_ref().is_some_and(|d| d.alert_triggered)
    }
}
