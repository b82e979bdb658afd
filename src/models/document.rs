use serde::{Deserialize, Serialize};

use super::enums::DocumentKind;
use crate::decimal::Decimal;

/// Normalized spatial coordinates inside a rendered page.
/// All components are in `[0, 1]` relative to page width/height.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl BoundingBox {
    pub fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f64 {
        self.y1 - self.y0
    }
}

/// A `(page, bbox)` reference locating a value inside its source document.
/// Pages are 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub page: u32,
    pub bbox: BoundingBox,
}

/// One line of a financial document, as parsed upstream.
/// All numerics are exact fixed-point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub claimed_total: Decimal,
    #[serde(default)]
    pub part_number: Option<String>,
    pub citation: Citation,
}

/// Document-level totals, each with its own spatial evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentTotals {
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub grand_total: Decimal,
    pub subtotal_citation: Citation,
    pub tax_citation: Citation,
    pub grand_total_citation: Citation,
}

/// An already-parsed financial document, immutable for the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub kind: DocumentKind,
    pub currency: String,
    pub vendor_name: String,
    pub document_number: String,
    pub document_date: String,
    pub page_count: u32,
    pub line_items: Vec<LineItem>,
    pub totals: DocumentTotals,
}

impl Document {
    /// A citation is only admissible if it points inside this document.
    pub fn contains_page(&self, page: u32) -> bool {
        page < self.page_count
    }
}

/// A retrieved text chunk with its spatial evidence and retrieval score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub text: String,
    pub citation: Citation,
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn bbox() -> BoundingBox {
        BoundingBox { x0: 0.1, y0: 0.2, x1: 0.6, y1: 0.25 }
    }

    #[test]
    fn bbox_dimensions() {
        let b = bbox();
        assert!((b.width() - 0.5).abs() < 1e-9);
        assert!((b.height() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn page_containment() {
        let doc = Document {
            document_id: "doc-1".into(),
            kind: DocumentKind::Po,
            currency: "USD".into(),
            vendor_name: "Acme Industrial".into(),
            document_number: "PO-1001".into(),
            document_date: "2026-05-01".into(),
            page_count: 2,
            line_items: vec![],
            totals: DocumentTotals {
                subtotal: Decimal::parse("0").unwrap(),
                tax: Decimal::parse("0").unwrap(),
                grand_total: Decimal::parse("0").unwrap(),
                subtotal_citation: Citation { page: 0, bbox: bbox() },
                tax_citation: Citation { page: 0, bbox: bbox() },
                grand_total_citation: Citation { page: 0, bbox: bbox() },
            },
        };
        assert!(doc.contains_page(0));
        assert!(doc.contains_page(1));
        assert!(!doc.contains_page(2));
    }

    #[test]
    fn line_item_serializes_decimals_as_strings() {
        let item = LineItem {
            description: "Steel bolts M8".into(),
            quantity: Decimal::parse("10").unwrap(),
            unit_price: Decimal::parse("50.00").unwrap(),
            claimed_total: Decimal::parse("500.00").unwrap(),
            part_number: Some("SB-M8".into()),
            citation: Citation { page: 0, bbox: bbox() },
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["quantity"], "10");
        assert_eq!(json["unit_price"], "50.00");
    }
}
