//! Seams to the upstream ingestion services.
//!
//! The pipeline never parses PDFs or indexes embeddings itself — it
//! consumes already-parsed documents and already-indexed chunks through
//! these traits. In-memory implementations back the tests and small
//! deployments.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;

use crate::models::document::{Document, ScoredChunk};
use crate::models::session::DivergenceFeedback;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document {0} not found")]
    DocumentNotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Parsed-document source.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn fetch_parsed(&self, document_id: &str) -> Result<Document, StoreError>;
}

/// Chunk retrieval over the vector index. `probe` is free text; the store
/// resolves embedding and similarity itself.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn retrieve_chunks(
        &self,
        document_id: &str,
        probe: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError>;
}

/// Recent divergence feedback per tenant, newest first. Read by the
/// adaptive threshold store; sync because threshold reads are O(1) hot path.
pub trait FeedbackStore: Send + Sync {
    fn recent(&self, tenant_id: &str, window: usize) -> Vec<DivergenceFeedback>;
    fn append(&self, feedback: DivergenceFeedback);
}

// ───────────────────────────────────────────────
// In-memory implementations
// ───────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<String, Document>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document: Document) {
        self.documents
            .write()
            .expect("document store lock poisoned")
            .insert(document.document_id.clone(), document);
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn fetch_parsed(&self, document_id: &str) -> Result<Document, StoreError> {
        self.documents
            .read()
            .expect("document store lock poisoned")
            .get(document_id)
            .cloned()
            .ok_or_else(|| StoreError::DocumentNotFound(document_id.to_string()))
    }
}

#[derive(Default)]
pub struct InMemoryVectorStore {
    chunks: RwLock<HashMap<String, Vec<ScoredChunk>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(&self, document_id: &str, chunks: Vec<ScoredChunk>) {
        self.chunks
            .write()
            .expect("vector store lock poisoned")
            .insert(document_id.to_string(), chunks);
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn retrieve_chunks(
        &self,
        document_id: &str,
        _probe: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let map = self.chunks.read().expect("vector store lock poisoned");
        let mut chunks = map.get(document_id).cloned().unwrap_or_default();
        chunks.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        chunks.truncate(top_k);
        Ok(chunks)
    }
}

#[derive(Default)]
pub struct InMemoryFeedbackStore {
    rows: Mutex<Vec<DivergenceFeedback>>,
}

impl InMemoryFeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FeedbackStore for InMemoryFeedbackStore {
    fn recent(&self, tenant_id: &str, window: usize) -> Vec<DivergenceFeedback> {
        let rows = self.rows.lock().expect("feedback store lock poisoned");
        rows.iter()
            .rev()
            .filter(|r| r.tenant_id == tenant_id)
            .take(window)
            .cloned()
            .collect()
    }

    fn append(&self, feedback: DivergenceFeedback) {
        self.rows
            .lock()
            .expect("feedback store lock poisoned")
            .push(feedback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::document::{BoundingBox, Citation, DocumentTotals};
    use crate::models::enums::{DocumentKind, FeedbackOutcome};
    use crate::decimal::Decimal;

    fn citation() -> Citation {
        Citation {
            page: 0,
            bbox: BoundingBox { x0: 0.0, y0: 0.0, x1: 1.0, y1: 0.1 },
        }
    }

    fn document(id: &str) -> Document {
        Document {
            document_id: id.into(),
            kind: DocumentKind::Po,
            currency: "USD".into(),
            vendor_name: "Acme".into(),
            document_number: "PO-1".into(),
            document_date: "2026-05-01".into(),
            page_count: 1,
            line_items: vec![],
            totals: DocumentTotals {
                subtotal: Decimal::zero(),
                tax: Decimal::zero(),
                grand_total: Decimal::zero(),
                subtotal_citation: citation(),
                tax_citation: citation(),
                grand_total_citation: citation(),
            },
        }
    }

    #[tokio::test]
    async fn document_store_round_trip() {
        let store = InMemoryDocumentStore::new();
        store.insert(document("doc-1"));
        let fetched = store.fetch_parsed("doc-1").await.unwrap();
        assert_eq!(fetched.document_id, "doc-1");
        assert!(matches!(
            store.fetch_parsed("missing").await,
            Err(StoreError::DocumentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn vector_store_ranks_and_truncates() {
        let store = InMemoryVectorStore::new();
        store.index(
            "doc-1",
            vec![
                ScoredChunk { text: "low".into(), citation: citation(), score: 0.2 },
                ScoredChunk { text: "high".into(), citation: citation(), score: 0.9 },
                ScoredChunk { text: "mid".into(), citation: citation(), score: 0.5 },
            ],
        );
        let chunks = store.retrieve_chunks("doc-1", "probe", 2).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "high");
        assert_eq!(chunks[1].text, "mid");
    }

    #[test]
    fn feedback_store_windows_per_tenant() {
        let store = InMemoryFeedbackStore::new();
        for i in 0..5 {
            store.append(DivergenceFeedback {
                session_id: format!("s-{i}"),
                tenant_id: "t-1".into(),
                similarity: 0.8,
                threshold_used: 0.85,
                was_alert: true,
                outcome: FeedbackOutcome::Correct,
            });
        }
        store.append(DivergenceFeedback {
            session_id: "other".into(),
            tenant_id: "t-2".into(),
            similarity: 0.9,
            threshold_used: 0.85,
            was_alert: false,
            outcome: FeedbackOutcome::FalseNegative,
        });

        let recent = store.recent("t-1", 3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].session_id, "s-4"); // newest first
        assert!(store.recent("t-2", 10).len() == 1);
    }
}
