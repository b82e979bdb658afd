use serde::{Deserialize, Serialize};

use super::document::Citation;
use super::enums::DocumentKind;
use crate::decimal::Decimal;

/// A line item in canonical extracted form. Numerics have already passed
/// through the decimal kernel; `citation` is attached by the citation binder
/// and stays `None` only when no chunk contained the literal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedLineItem {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub total: Decimal,
    #[serde(default)]
    pub part_number: Option<String>,
    #[serde(default)]
    pub citation: Option<Citation>,
}

/// Canonical structured form of one document after the extraction stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub document_id: String,
    pub kind: DocumentKind,
    pub vendor_name: String,
    pub document_number: String,
    pub document_date: String,
    pub currency: String,
    pub line_items: Vec<ExtractedLineItem>,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub grand_total: Decimal,
    pub subtotal_citation: Option<Citation>,
    pub tax_citation: Option<Citation>,
    pub grand_total_citation: Option<Citation>,
    /// True when this document's extraction was served by the deterministic
    /// fallback rather than a live model.
    #[serde(default)]
    pub degraded: bool,
}

/// The extraction stage's slot: one canonical document per kind.
/// Kinds that failed extraction stay `None`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedData {
    pub po: Option<ExtractedDocument>,
    pub grn: Option<ExtractedDocument>,
    pub invoice: Option<ExtractedDocument>,
}

impl ExtractedData {
    pub fn get(&self, kind: DocumentKind) -> Option<&ExtractedDocument> {
        match kind {
            DocumentKind::Po => self.po.as_ref(),
            DocumentKind::Grn => self.grn.as_ref(),
            DocumentKind::Invoice => self.invoice.as_ref(),
        }
    }

    pub fn set(&mut self, kind: DocumentKind, doc: ExtractedDocument) {
        match kind {
            DocumentKind::Po => self.po = Some(doc),
            DocumentKind::Grn => self.grn = Some(doc),
            DocumentKind::Invoice => self.invoice = Some(doc),
        }
    }

    pub fn present_count(&self) -> usize {
        DocumentKind::ALL.iter().filter(|k| self.get(**k).is_some()).count()
    }

    /// True when any present document came from the deterministic fallback.
    pub fn any_degraded(&self) -> bool {
        DocumentKind::ALL
            .iter()
            .filter_map(|k| self.get(*k))
            .any(|d| d.degraded)
    }
}
