//! Workpaper composer — the final structured artifact.
//!
//! The composer is a pure function of earlier stages' outputs plus the
//! narrative text: numbers and citations are copied from the state, never
//! re-derived and never model-generated. Rendering (HTML, PDF) happens
//! outside the pipeline against this structure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::intervals::{field_interval, FieldInterval};
use crate::models::document::Citation;
use crate::models::enums::MatchStatus;
use crate::models::extracted::ExtractedData;
use crate::models::verdict::{ComplianceReport, DivergenceMetrics, QuantitativeReport, Verdict};

/// The five narrative sections of an audit workpaper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkpaperSections {
    pub objective: String,
    pub procedure: String,
    pub findings: String,
    pub materiality: String,
    pub conclusion: String,
}

/// One row of the line-item reconciliation table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkpaperRow {
    pub po_description: Option<String>,
    pub grn_description: Option<String>,
    pub invoice_description: Option<String>,
    pub status: MatchStatus,
    pub description_score: f64,
    pub quantity_delta: Option<String>,
    pub price_delta: Option<String>,
    /// Confidence interval on the invoiced line total, when available.
    pub total_interval: Option<FieldInterval>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompliancePanel {
    pub risk_score: f64,
    pub flags: Vec<crate::models::verdict::ComplianceFlag>,
    pub policy_violations: Vec<String>,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivergencePanel {
    pub similarity: f64,
    pub threshold: f64,
    pub alert_triggered: bool,
    pub degraded: bool,
    pub perturbation_summary: String,
}

/// A value with its spatial evidence, for the workpaper's evidence map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub label: String,
    pub value: String,
    pub citation: Option<Citation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workpaper {
    /// Assigned by the drafting agent when the artifact is issued; empty
    /// while the workpaper is only composed.
    #[serde(default)]
    pub id: String,
    pub session_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub verdict_summary: String,
    pub sections: WorkpaperSections,
    pub line_item_table: Vec<WorkpaperRow>,
    pub compliance_panel: Option<CompliancePanel>,
    pub divergence_panel: Option<DivergencePanel>,
    pub citations: Vec<EvidenceRef>,
    /// Deterministic quantitative findings, one line each.
    pub quantitative_findings: Vec<String>,
}

/// Compose the workpaper from prior stages' outputs.
///
/// `narrative` fills the findings section; everything else is assembled
/// from the state without model involvement.
pub fn compose(
    session_id: &str,
    extracted: Option<&ExtractedData>,
    quantitative: Option<&QuantitativeReport>,
    compliance: Option<&ComplianceReport>,
    divergence: Option<&DivergenceMetrics>,
    verdict: &Verdict,
    narrative: &str,
    created_at: DateTime<Utc>,
) -> Workpaper {
    let alert = divergence.map(|d| d.alert_triggered).unwrap_or(false);

    let line_item_table = verdict
        .line_item_matches
        .iter()
        .map(|m| {
            let description = |idx: Option<usize>, doc: Option<&crate::models::extracted::ExtractedDocument>| {
                idx.and_then(|i| doc.and_then(|d| d.line_items.get(i)))
                    .map(|item| item.description.clone())
            };
            let (po, grn, invoice) = match extracted {
                Some(data) => (data.po.as_ref(), data.grn.as_ref(), data.invoice.as_ref()),
                None => (None, None, None),
            };

            let total_interval = m
                .invoice_index
                .and_then(|i| invoice.and_then(|d| d.line_items.get(i)))
                .and_then(|item| {
                    let value: f64 = item.total.to_plain_string().parse().ok()?;
                    let confidence = if item.citation.is_some() { 0.97 } else { 0.80 };
                    Some(field_interval("line_total", value, confidence, alert))
                });

            WorkpaperRow {
                po_description: description(m.po_index, po),
                grn_description: description(m.grn_index, grn),
                invoice_description: description(m.invoice_index, invoice),
                status: m.status,
                description_score: m.description_score,
                quantity_delta: m.quantity_delta.as_ref().map(|d| d.to_plain_string()),
                price_delta: m.price_delta.as_ref().map(|d| d.to_plain_string()),
                total_interval,
            }
        })
        .collect();

    let compliance_panel = compliance.map(|c| CompliancePanel {
        risk_score: c.risk_score,
        flags: c.flags.clone(),
        policy_violations: c.policy_violations.clone(),
        degraded: c.degraded,
    });

    let divergence_panel = divergence.map(|d| DivergencePanel {
        similarity: d.similarity,
        threshold: d.threshold,
        alert_triggered: d.alert_triggered,
        degraded: d.degraded,
        perturbation_summary: d.perturbation_summary.clone(),
    });

    let citations = extracted.map(evidence_map).unwrap_or_default();

    let quantitative_findings = quantitative
        .map(|q| q.flags.iter().map(|f| format!("{}: {}", f.kind, f.detail)).collect())
        .unwrap_or_default();

    Workpaper {
        id: String::new(),
        session_id: session_id.to_string(),
        title: format!("Three-Way Match Audit Workpaper — {}", created_at.format("%Y-%m-%d")),
        created_at,
        verdict_summary: verdict.overall_status.as_str().to_string(),
        sections: sections_for(verdict, quantitative, narrative),
        line_item_table,
        compliance_panel,
        divergence_panel,
        citations,
        quantitative_findings,
    }
}

fn sections_for(
    verdict: &Verdict,
    quantitative: Option<&QuantitativeReport>,
    narrative: &str,
) -> WorkpaperSections {
    let flag_count = quantitative.map(|q| q.flags.len()).unwrap_or(0);
    WorkpaperSections {
        objective: "Determine whether the Purchase Order, Goods Receipt Note and Supplier \
                    Invoice agree on quantity, price and description before payment authorization."
            .to_string(),
        procedure: "Recomputed line and document arithmetic with exact decimal arithmetic; \
                    resolved line items across documents by token-set similarity with part-number \
                    override; evaluated compliance rules; ran the dual-stream divergence guard."
            .to_string(),
        findings: narrative.to_string(),
        materiality: format!(
            "{} quantitative finding(s); tolerance one cent absolute on monetary totals, \
             0.1% relative on unit prices, exact on quantities.",
            flag_count
        ),
        conclusion: format!(
            "Overall status {}; recommendation {}; confidence {:.2}.",
            verdict.overall_status, verdict.recommendation, verdict.confidence
        ),
    }
}

/// Flatten every cited value of the extracted data into the evidence map.
fn evidence_map(extracted: &ExtractedData) -> Vec<EvidenceRef> {
    let mut refs = Vec::new();
    for kind in crate::models::enums::DocumentKind::ALL {
        let Some(doc) = extracted.get(kind) else { continue };
        let label = |field: &str| format!("{}.{}", kind.as_str(), field);

        refs.push(EvidenceRef {
            label: label("vendor_name"),
            value: doc.vendor_name.clone(),
            citation: None,
        });
        refs.push(EvidenceRef {
            label: label("grand_total"),
            value: doc.grand_total.to_plain_string(),
            citation: doc.grand_total_citation,
        });
        refs.push(EvidenceRef {
            label: label("subtotal"),
            value: doc.subtotal.to_plain_string(),
            citation: doc.subtotal_citation,
        });
        refs.push(EvidenceRef {
            label: label("tax"),
            value: doc.tax.to_plain_string(),
            citation: doc.tax_citation,
        });
        for (i, item) in doc.line_items.iter().enumerate() {
            refs.push(EvidenceRef {
                label: format!("{}.line[{}].total", kind.as_str(), i),
                value: item.total.to_plain_string(),
                citation: item.citation,
            });
        }
    }
    refs
}
