use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::enums::{SessionStatus, Stage};

/// Payload of one progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressPayload {
    WorkflowStarted {
        total_stages: usize,
    },
    AgentStarted {
        stage: Stage,
        message: String,
    },
    AgentProgress {
        stage: Stage,
        message: String,
    },
    AgentCompleted {
        stage: Stage,
        duration_ms: u64,
    },
    DivergenceAlert {
        similarity: f64,
        threshold: f64,
        perturbation_summary: String,
    },
    DivergenceClear {
        similarity: f64,
    },
    WorkflowComplete {
        status: SessionStatus,
        verdict_summary: String,
    },
    WorkflowError {
        stage: Stage,
        message: String,
    },
    Ping {},
}

impl ProgressPayload {
    /// The terminal event after which the bus closes the session server-side.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::WorkflowComplete { .. })
    }
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: ProgressPayload,
}
