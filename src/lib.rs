//! ledgermatch — staged multi-agent pipeline for three-way financial
//! document reconciliation.
//!
//! Given a Purchase Order, a Goods Receipt Note and a Supplier Invoice
//! (already parsed and indexed upstream), the pipeline produces an
//! auditable verdict in which every numerical conclusion is linked back to
//! a `(page, bbox)` region of its source document.
//!
//! The moving parts, leaves first:
//! - [`decimal`] — exact fixed-point arithmetic and tolerance policy
//! - [`matching`] — token-set entity resolution with part-number override
//! - [`llm`] — ordered-failover router over reasoning providers
//! - [`progress`] — per-session event fan-out with drop-oldest backpressure
//! - [`agents`] — the six cooperating agents
//! - [`pipeline`] — the supervisor and the public API
//! - [`threshold`] — per-tenant adaptive divergence threshold
//! - [`workpaper`] — the final structured artifact

pub mod agents;
pub mod citations;
pub mod config;
pub mod db;
pub mod decimal;
pub mod error;
pub mod intervals;
pub mod llm;
pub mod matching;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod sanitize;
pub mod state;
pub mod stores;
pub mod threshold;
pub mod workpaper;

pub use config::PipelineConfig;
pub use error::{ErrorKind, PipelineError, StageError};
pub use models::{
    Document, DocumentKind, RunRequest, SessionRecord, SessionStatus, Verdict,
};
pub use pipeline::{ComplianceProbe, PipelineContext, ReconciliationPipeline};
pub use state::PipelineState;
