//! Extraction agent — canonical structured form with spatial citations.
//!
//! Per document: retrieve the top chunks for a per-kind probe, re-rank
//! them by probe-term relevance, prompt the model for the canonical
//! schema (numerics as strings), parse every numeric through the decimal
//! kernel, and bind each value to the chunk that contains its literal.
//! The three documents extract in parallel; a single failed document
//! degrades the session instead of killing it.

use serde_json::Value;

use crate::citations::{bind_field, bind_literal, UnresolvedValue};
use crate::decimal::Decimal;
use crate::error::{ErrorKind, StageError};
use crate::llm::CompletionRequest;
use crate::models::document::{Document, ScoredChunk};
use crate::models::enums::{DocumentKind, Stage};
use crate::models::extracted::{ExtractedData, ExtractedDocument, ExtractedLineItem};
use crate::pipeline::PipelineContext;
use crate::progress::ProgressPayload;
use crate::sanitize::sanitize_document_text;
use crate::state::PipelineState;

const SYSTEM_PROMPT: &str = "You are a precise financial document extraction specialist. \
Extract structured line items from financial documents. Respond with valid JSON only. \
Every numeric value must be a string preserving the exact digits found in the document. \
Never infer values that are not explicitly present.";

/// Per-kind retrieval probe, matched against indexed chunks.
fn probe_for(kind: DocumentKind) -> &'static str {
    match kind {
        DocumentKind::Po => "line items purchase order quantity unit price",
        DocumentKind::Grn => "goods receipt quantity received units",
        DocumentKind::Invoice => "invoice line items amount due tax total",
    }
}

pub async fn run(ctx: &PipelineContext, state: &mut PipelineState) -> Result<(), StageError> {
    let session_id = state.session_id.clone();

    let po_id = required_document_id(state, DocumentKind::Po)?;
    let grn_id = required_document_id(state, DocumentKind::Grn)?;
    let invoice_id = required_document_id(state, DocumentKind::Invoice)?;

    // Fan out across the three documents; the router's semaphore caps
    // process-wide concurrency, this session contributes at most 3 calls.
    let (po, grn, invoice) = tokio::join!(
        extract_one(ctx, &session_id, DocumentKind::Po, &po_id),
        extract_one(ctx, &session_id, DocumentKind::Grn, &grn_id),
        extract_one(ctx, &session_id, DocumentKind::Invoice, &invoice_id),
    );

    let mut data = ExtractedData::default();
    let mut degraded = false;

    for (kind, outcome) in [
        (DocumentKind::Po, po),
        (DocumentKind::Grn, grn),
        (DocumentKind::Invoice, invoice),
    ] {
        match outcome {
            Ok(extraction) => {
                degraded |= extraction.document.degraded;
                for unresolved in extraction.unresolved {
                    state.push_error(StageError::non_fatal(
                        Stage::Extraction,
                        ErrorKind::UnresolvedCitation,
                        format!("{}.{}: `{}`", kind.as_str(), unresolved.field, unresolved.value),
                    ));
                }
                set_source_document(state, kind, extraction.source);
                data.set(kind, extraction.document);
            }
            Err(e) => {
                tracing::error!(
                    session_id = %session_id,
                    kind = kind.as_str(),
                    error = %e.message,
                    "document extraction failed"
                );
                state.push_error(e);
            }
        }
    }

    if degraded {
        state.push_error(StageError::non_fatal(
            Stage::Extraction,
            ErrorKind::UpstreamUnavailable,
            "extraction served by deterministic fallback",
        ));
    }

    ctx.bus.publish(
        &session_id,
        ProgressPayload::AgentProgress {
            stage: Stage::Extraction,
            message: format!("{} of 3 documents extracted", data.present_count()),
        },
    );

    state.extracted = Some(data);
    Ok(())
}

fn required_document_id(state: &PipelineState, kind: DocumentKind) -> Result<String, StageError> {
    let id = match kind {
        DocumentKind::Po => state.po_document_id.clone(),
        DocumentKind::Grn => state.grn_document_id.clone(),
        DocumentKind::Invoice => state.invoice_document_id.clone(),
    };
    if id.is_empty() {
        return Err(StageError::fatal(
            Stage::Extraction,
            ErrorKind::ContractViolation,
            format!("{} document id missing from state", kind.as_str()),
        ));
    }
    Ok(id)
}

fn set_source_document(state: &mut PipelineState, kind: DocumentKind, doc: Document) {
    match kind {
        DocumentKind::Po => state.po_document = Some(doc),
        DocumentKind::Grn => state.grn_document = Some(doc),
        DocumentKind::Invoice => state.invoice_document = Some(doc),
    }
}

struct DocumentExtraction {
    document: ExtractedDocument,
    source: Document,
    unresolved: Vec<UnresolvedValue>,
}

async fn extract_one(
    ctx: &PipelineContext,
    session_id: &str,
    kind: DocumentKind,
    document_id: &str,
) -> Result<DocumentExtraction, StageError> {
    let source = ctx
        .documents
        .fetch_parsed(document_id)
        .await
        .map_err(|e| StageError::non_fatal(Stage::Extraction, ErrorKind::UnavailableInput, e.to_string()))?;

    let probe = probe_for(kind);
    let chunks = ctx
        .vectors
        .retrieve_chunks(document_id, probe, ctx.config.extraction.retrieve_top_k)
        .await
        .map_err(|e| StageError::non_fatal(Stage::Extraction, ErrorKind::UnavailableInput, e.to_string()))?;

    if chunks.is_empty() {
        return Err(StageError::non_fatal(
            Stage::Extraction,
            ErrorKind::UnavailableInput,
            format!("no indexed chunks for {} document {document_id}", kind.as_str()),
        ));
    }

    let chunks = rerank(probe, chunks, ctx.config.extraction.rerank_keep);

    let combined = chunks
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let sanitized = sanitize_document_text(&combined, ctx.config.extraction.max_chunk_chars);
    if !sanitized.threats_found.is_empty() {
        tracing::warn!(
            session_id,
            kind = kind.as_str(),
            threats = ?sanitized.threats_found,
            "document text sanitized before prompting"
        );
    }

    let prompt = extraction_prompt(kind, &sanitized.cleaned_text);
    let routed = ctx
        .router
        .complete_json(&CompletionRequest::json(prompt, SYSTEM_PROMPT))
        .await
        .map_err(|e| StageError::non_fatal(Stage::Extraction, ErrorKind::UpstreamUnavailable, e.to_string()))?;

    let mut document = parse_extraction(kind, document_id, &routed.value)
        .map_err(|message| StageError::non_fatal(Stage::Extraction, ErrorKind::ParseError, message))?;
    document.degraded = routed.degraded;

    let unresolved = bind_citations(&mut document, &chunks, &source);

    Ok(DocumentExtraction { document, source, unresolved })
}

/// Cross-encoder-style relevance: fraction of probe terms present in the
/// chunk, with the retrieval score breaking ties. Keep the top `keep`.
fn rerank(probe: &str, mut chunks: Vec<ScoredChunk>, keep: usize) -> Vec<ScoredChunk> {
    let terms: Vec<String> = probe.split_whitespace().map(str::to_lowercase).collect();
    let relevance = |chunk: &ScoredChunk| -> f64 {
        let text = chunk.text.to_lowercase();
        let hits = terms.iter().filter(|t| text.contains(t.as_str())).count();
        hits as f64 / terms.len().max(1) as f64
    };
    chunks.sort_by(|a, b| {
        relevance(b)
            .partial_cmp(&relevance(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
    });
    chunks.truncate(keep);
    chunks
}

fn extraction_prompt(kind: DocumentKind, text: &str) -> String {
    format!(
        "Extract all line items from the following {} document text.\n\n\
         Document Text:\n{text}\n\n\
         Return JSON with this exact schema (every numeric as a string):\n\
         {{\n\
           \"vendor_name\": \"\",\n\
           \"document_number\": \"\",\n\
           \"document_date\": \"\",\n\
           \"currency\": \"USD\",\n\
           \"line_items\": [\n\
             {{\"description\": \"\", \"quantity\": \"0\", \"unit_price\": \"0.00\", \
              \"total\": \"0.00\", \"part_number\": null}}\n\
           ],\n\
           \"subtotal\": \"0.00\",\n\
           \"tax\": \"0.00\",\n\
           \"grand_total\": \"0.00\"\n\
         }}",
        kind.label()
    )
}

/// Parse the model's JSON into the canonical form. Numerics must be strings
/// (or integers); binary floats are rejected as precision loss. Line items
/// that fail to parse are dropped with a warning rather than failing the
/// document.
fn parse_extraction(
    kind: DocumentKind,
    document_id: &str,
    value: &Value,
) -> Result<ExtractedDocument, String> {
    let text = |key: &str| -> String {
        value.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
    };

    let subtotal = decimal_field(value, "subtotal")?;
    let tax = decimal_field(value, "tax")?;
    let grand_total = decimal_field(value, "grand_total")?;

    let mut line_items = Vec::new();
    let mut dropped = 0usize;
    if let Some(items) = value.get("line_items").and_then(Value::as_array) {
        for (i, item) in items.iter().enumerate() {
            match parse_line_item(item) {
                Ok(parsed) => line_items.push(parsed),
                Err(e) => {
                    dropped += 1;
                    tracing::warn!(index = i, error = %e, "dropped line item during lenient parse");
                }
            }
        }
    }
    if dropped > 0 {
        tracing::warn!(kind = kind.as_str(), dropped, "line items dropped during extraction parse");
    }

    Ok(ExtractedDocument {
        document_id: document_id.to_string(),
        kind,
        vendor_name: text("vendor_name"),
        document_number: text("document_number"),
        document_date: text("document_date"),
        currency: {
            let c = text("currency");
            if c.is_empty() { "USD".to_string() } else { c }
        },
        line_items,
        subtotal,
        tax,
        grand_total,
        subtotal_citation: None,
        tax_citation: None,
        grand_total_citation: None,
        degraded: false,
    })
}

fn parse_line_item(item: &Value) -> Result<ExtractedLineItem, String> {
    let description = item
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if description.is_empty() {
        return Err("line item without description".into());
    }
    Ok(ExtractedLineItem {
        description,
        quantity: decimal_field(item, "quantity")?,
        unit_price: decimal_field(item, "unit_price")?,
        total: decimal_field(item, "total")?,
        part_number: item
            .get("part_number")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string),
        citation: None,
    })
}

/// Strings parse strictly; integers are exact and accepted; binary floats
/// would lose precision and are refused.
fn decimal_field(value: &Value, key: &str) -> Result<Decimal, String> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(Decimal::zero()),
        Some(Value::String(s)) => {
            Decimal::parse(s).map_err(|e| format!("{key}: {e}"))
        }
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Decimal::parse(&i.to_string()).map_err(|e| format!("{key}: {e}"))
            } else {
                Err(format!("{key}: binary float {n} refused, use a string"))
            }
        }
        Some(other) => Err(format!("{key}: unexpected {other}")),
    }
}

/// Attach a citation to every extracted scalar, validating pages against
/// the source document. Returns the values no chunk contained.
fn bind_citations(
    document: &mut ExtractedDocument,
    chunks: &[ScoredChunk],
    source: &Document,
) -> Vec<UnresolvedValue> {
    let mut unresolved = Vec::new();

    // A citation must point at a page the document actually has; chunks
    // with stale pages never bind.
    let chunks: Vec<ScoredChunk> = chunks
        .iter()
        .filter(|c| {
            let ok = source.contains_page(c.citation.page);
            if !ok {
                tracing::warn!(page = c.citation.page, "chunk cites page outside document, discarded");
            }
            ok
        })
        .cloned()
        .collect();

    document.subtotal_citation = bind_field(
        "subtotal",
        &document.subtotal.to_plain_string(),
        true,
        &chunks,
        &mut unresolved,
    );
    document.tax_citation = bind_field(
        "tax",
        &document.tax.to_plain_string(),
        true,
        &chunks,
        &mut unresolved,
    );
    document.grand_total_citation = bind_field(
        "grand_total",
        &document.grand_total.to_plain_string(),
        true,
        &chunks,
        &mut unresolved,
    );

    for (i, item) in document.line_items.iter_mut().enumerate() {
        // One citation per line: the description anchors it; the line total
        // is the fallback literal.
        item.citation = bind_literal(&item.description, &chunks).or_else(|| {
            crate::citations::bind_numeric(&item.total.to_plain_string(), &chunks)
        });
        if item.citation.is_none() {
            unresolved.push(UnresolvedValue {
                field: format!("line[{i}]"),
                value: item.description.clone(),
            });
        }
    }

    unresolved
}
