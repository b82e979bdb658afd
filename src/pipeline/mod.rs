pub mod supervisor;

use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::db::repository;
use crate::error::PipelineError;
use crate::llm::LlmRouter;
use crate::models::session::{DivergenceFeedback, RunRequest, SessionRecord};
use crate::progress::{ProgressBus, ProgressSubscription};
use crate::stores::{DocumentStore, VectorStore};
use crate::threshold::AdaptiveThresholdStore;

/// History probes for the compliance rules. Sourced upstream; the pipeline
/// treats them as read-only input.
#[derive(Debug, Clone, Default)]
pub struct ComplianceProbe {
    pub known_invoice_numbers: Vec<String>,
    pub known_vendors: Vec<String>,
}

/// Everything the pipeline needs, passed in explicitly. No process-wide
/// singletons; two pipelines with different contexts can coexist in one
/// process.
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub router: Arc<LlmRouter>,
    pub bus: Arc<ProgressBus>,
    pub documents: Arc<dyn DocumentStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub thresholds: Arc<AdaptiveThresholdStore>,
    pub probe: ComplianceProbe,
    /// Session/divergence persistence. `None` runs the pipeline without
    /// durable records (tests, dry runs).
    pub db: Option<Arc<Mutex<Connection>>>,
}

/// The pipeline core consumed by the transport layer.
pub struct ReconciliationPipeline {
    ctx: PipelineContext,
}

impl ReconciliationPipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Run one reconciliation session to a terminal state. Cancellation
    /// aborts the current stage at the next await point; the session record
    /// then carries `cancelled` status.
    pub async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<SessionRecord, PipelineError> {
        let record = supervisor::run_session(&self.ctx, &request, cancel).await?;
        self.persist(&record)?;
        Ok(record)
    }

    /// Subscribe to a session's live progress events.
    pub fn subscribe(&self, session_id: &str) -> ProgressSubscription {
        self.ctx.bus.subscribe(session_id)
    }

    /// Start the 15-second keepalive ping over all open sessions.
    /// Call once from the host's runtime; abort the handle on shutdown.
    pub fn start_keepalive(&self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.ctx.bus).keepalive_loop())
    }

    /// Record analyst feedback on a past divergence decision; the tenant's
    /// threshold will be recomputed on its next read.
    pub fn record_divergence_feedback(
        &self,
        feedback: DivergenceFeedback,
    ) -> Result<(), PipelineError> {
        if let Some(db) = &self.ctx.db {
            let conn = db.lock().expect("db lock poisoned");
            repository::insert_feedback(&conn, &feedback)?;
        }
        self.ctx.thresholds.record_feedback(feedback);
        Ok(())
    }

    fn persist(&self, record: &SessionRecord) -> Result<(), PipelineError> {
        let Some(db) = &self.ctx.db else {
            return Ok(());
        };
        let conn = db.lock().expect("db lock poisoned");
        repository::upsert_session(&conn, record)?;
        Ok(())
    }
}
