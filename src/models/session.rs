use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{FeedbackOutcome, SessionStatus};
use super::verdict::Verdict;
use crate::error::StageError;
use crate::state::AgentTraceEntry;

/// Request to reconcile one document triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub session_id: String,
    pub tenant_id: String,
    pub po_document_id: String,
    pub grn_document_id: String,
    pub invoice_document_id: String,
}

/// The session's authoritative record, persisted at terminal states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub tenant_id: String,
    pub po_document_id: String,
    pub grn_document_id: String,
    pub invoice_document_id: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub verdict: Option<Verdict>,
    pub agent_trace: Vec<AgentTraceEntry>,
    pub errors: Vec<StageError>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persisted outcome of one divergence-guard run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivergenceRecord {
    pub session_id: String,
    pub tenant_id: String,
    pub primary_summary: String,
    pub shadow_summary: String,
    pub similarity: f64,
    pub threshold_used: f64,
    pub alert_triggered: bool,
    pub perturbation_summary: String,
    pub created_at: DateTime<Utc>,
}

/// Analyst feedback on a past divergence decision. Feeds the adaptive
/// threshold store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivergenceFeedback {
    pub session_id: String,
    pub tenant_id: String,
    pub similarity: f64,
    pub threshold_used: f64,
    pub was_alert: bool,
    pub outcome: FeedbackOutcome,
}
