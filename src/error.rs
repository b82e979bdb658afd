use serde::{Deserialize, Serialize};

use crate::models::enums::Stage;

/// Classification of a stage-level failure.
///
/// Non-fatal kinds are collected on the state and the supervisor continues;
/// `ContractViolation` and `Cancelled` terminate the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// An input value could not be represented without precision loss.
    ParseError,
    /// Router exhausted every non-terminal provider and served the
    /// deterministic fallback instead.
    UpstreamUnavailable,
    /// Stage exceeded its deadline; its slot stays empty.
    Timeout,
    /// Internal invariant broken. Always fatal.
    ContractViolation,
    /// External cancellation. Terminal.
    Cancelled,
    /// Reasoning vector unusable (zero norm, NaN, dimension mismatch).
    VectorDegenerate,
    /// Extracted value has no spatial evidence in any retrieved chunk.
    UnresolvedCitation,
    /// A stage found a required upstream slot empty and produced a
    /// best-effort partial output.
    UnavailableInput,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
            Self::ContractViolation => "CONTRACT_VIOLATION",
            Self::Cancelled => "CANCELLED",
            Self::VectorDegenerate => "VECTOR_DEGENERATE",
            Self::UnresolvedCitation => "UNRESOLVED_CITATION",
            Self::UnavailableInput => "UNAVAILABLE_INPUT",
        }
    }
}

/// An error recorded against a stage. Appended to `PipelineState::errors`,
/// never removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageError {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
    pub fatal: bool,
}

impl StageError {
    pub fn non_fatal(stage: Stage, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(stage: Stage, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
            fatal: true,
        }
    }
}

/// Top-level pipeline error.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("decimal parse error: {0}")]
    DecimalParse(String),

    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("session cancelled")]
    Cancelled,

    #[error("document store: {0}")]
    DocumentStore(String),

    #[error("vector store: {0}")]
    VectorStore(String),

    #[error("database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("llm router: {0}")]
    Router(String),

    #[error("session {0} is not in a runnable state")]
    NotRunnable(String),
}
