//! Quantitative agent — deterministic arithmetic validation.
//!
//! No model calls. Within each document: line arithmetic, document total,
//! tax composition. Across documents: short delivery, overbilling, price
//! deviation, resolved pairwise through the fuzzy matcher. Monetary values
//! are equal only when they differ by less than one cent; a one-cent
//! discrepancy is a finding, not noise.

use crate::decimal::{money_tolerance, price_relative_tolerance, Decimal};
use crate::error::{ErrorKind, StageError};
use crate::matching::fuzzy::best_match;
use crate::models::enums::{DocumentKind, FlagKind, Stage};
use crate::models::extracted::{ExtractedDocument, ExtractedLineItem};
use crate::models::verdict::{QuantFlag, QuantitativeReport};
use crate::pipeline::PipelineContext;
use crate::state::PipelineState;

pub async fn run(_ctx: &PipelineContext, state: &mut PipelineState) -> Result<(), StageError> {
    let Some(extracted) = state.extracted.clone() else {
        state.push_error(StageError::non_fatal(
            Stage::Quantitative,
            ErrorKind::UnavailableInput,
            "no extracted data; arithmetic checks skipped",
        ));
        state.quantitative = Some(QuantitativeReport { flags: vec![], math_verified: false });
        return Ok(());
    };

    let mut flags = Vec::new();

    for kind in DocumentKind::ALL {
        if let Some(doc) = extracted.get(kind) {
            check_document(doc, &mut flags);
        }
    }

    cross_document_checks(
        extracted.get(DocumentKind::Po),
        extracted.get(DocumentKind::Grn),
        extracted.get(DocumentKind::Invoice),
        &mut flags,
    );

    let math_verified = flags.is_empty();
    tracing::info!(
        session_id = %state.session_id,
        flags = flags.len(),
        math_verified,
        "quantitative validation complete"
    );

    state.quantitative = Some(QuantitativeReport { flags, math_verified });
    Ok(())
}

/// Monetary equality gate: amounts agree only when they differ by less
/// than one cent. Sub-cent noise passes; a full cent is a discrepancy.
fn money_differs(a: &Decimal, b: &Decimal) -> bool {
    a.sub(b).abs() >= money_tolerance()
}

fn check_document(doc: &ExtractedDocument, flags: &mut Vec<QuantFlag>) {
    let kind = doc.kind;

    // Line arithmetic: quantity × unit price vs claimed total.
    for (i, item) in doc.line_items.iter().enumerate() {
        let computed = item.quantity.mul(&item.unit_price);
        if money_differs(&computed, &item.total) {
            flags.push(QuantFlag {
                kind: FlagKind::LineArithmetic,
                document: Some(kind),
                line: Some(i),
                detail: format!(
                    "{} line {}: {} × {} = {}, document claims {}",
                    kind.label(),
                    i,
                    item.quantity,
                    item.unit_price,
                    computed,
                    item.total
                ),
                delta: Some(computed.sub(&item.total)),
            });
        }
    }

    // Document total: line items are pre-tax, so their sum must equal the
    // declared subtotal. The grand total is tied in by the tax composition
    // check below.
    if !doc.line_items.is_empty() {
        let line_sum = doc
            .line_items
            .iter()
            .fold(Decimal::zero(), |acc, item| acc.add(&item.total));
        if money_differs(&line_sum, &doc.subtotal) {
            flags.push(QuantFlag {
                kind: FlagKind::DocTotalArithmetic,
                document: Some(kind),
                line: None,
                detail: format!(
                    "{}: line totals sum to {}, declared subtotal is {}",
                    kind.label(),
                    line_sum,
                    doc.subtotal
                ),
                delta: Some(line_sum.sub(&doc.subtotal)),
            });
        }
    }

    // Tax composition: subtotal + tax vs grand total.
    let composed = doc.subtotal.add(&doc.tax);
    if money_differs(&composed, &doc.grand_total) {
        flags.push(QuantFlag {
            kind: FlagKind::TaxComposition,
            document: Some(kind),
            line: None,
            detail: format!(
                "{}: subtotal {} + tax {} = {}, grand total is {}",
                kind.label(),
                doc.subtotal,
                doc.tax,
                composed,
                doc.grand_total
            ),
            delta: Some(composed.sub(&doc.grand_total)),
        });
    }
}

/// Resolve line items pairwise and compare quantities and prices.
fn cross_document_checks(
    po: Option<&ExtractedDocument>,
    grn: Option<&ExtractedDocument>,
    invoice: Option<&ExtractedDocument>,
    flags: &mut Vec<QuantFlag>,
) {
    // PO × GRN: goods received short of what was ordered.
    if let (Some(po), Some(grn)) = (po, grn) {
        for (po_item, grn_item, _) in paired_items(&po.line_items, &grn.line_items) {
            if grn_item.quantity < po_item.quantity {
                flags.push(QuantFlag {
                    kind: FlagKind::ShortDelivery,
                    document: Some(DocumentKind::Grn),
                    line: None,
                    detail: format!(
                        "`{}`: ordered {}, received {}",
                        po_item.description, po_item.quantity, grn_item.quantity
                    ),
                    delta: Some(po_item.quantity.sub(&grn_item.quantity)),
                });
            }
        }
    }

    // GRN × Invoice: billed more than was received.
    if let (Some(grn), Some(invoice)) = (grn, invoice) {
        for (grn_item, inv_item, _) in paired_items(&grn.line_items, &invoice.line_items) {
            if inv_item.quantity > grn_item.quantity {
                flags.push(QuantFlag {
                    kind: FlagKind::Overbilling,
                    document: Some(DocumentKind::Invoice),
                    line: None,
                    detail: format!(
                        "`{}`: received {}, invoiced {}",
                        grn_item.description, grn_item.quantity, inv_item.quantity
                    ),
                    delta: Some(inv_item.quantity.sub(&grn_item.quantity)),
                });
            }
        }
    }

    // PO × Invoice: unit price drifted beyond 0.1%.
    if let (Some(po), Some(invoice)) = (po, invoice) {
        for (po_item, inv_item, _) in paired_items(&po.line_items, &invoice.line_items) {
            if !po_item
                .unit_price
                .within_relative(&inv_item.unit_price, &price_relative_tolerance())
            {
                flags.push(QuantFlag {
                    kind: FlagKind::PriceDeviation,
                    document: Some(DocumentKind::Invoice),
                    line: None,
                    detail: format!(
                        "`{}`: agreed unit price {}, invoiced {}",
                        po_item.description, po_item.unit_price, inv_item.unit_price
                    ),
                    delta: Some(inv_item.unit_price.sub(&po_item.unit_price)),
                });
            }
        }
    }
}

/// Resolve items of `left` against `right` with the fuzzy matcher,
/// yielding linked pairs. Each right-hand item is claimed at most once.
fn paired_items<'a>(
    left: &'a [ExtractedLineItem],
    right: &'a [ExtractedLineItem],
) -> Vec<(&'a ExtractedLineItem, &'a ExtractedLineItem, f64)> {
    let mut taken = vec![false; right.len()];
    let mut pairs = Vec::new();
    for item in left {
        let found = best_match(
            &item.description,
            item.part_number.as_deref(),
            right
                .iter()
                .enumerate()
                .map(|(i, r)| (i, r.description.as_str(), r.part_number.as_deref())),
            &taken,
        );
        if let Some(m) = found {
            taken[m.index] = true;
            pairs.push((item, &right[m.index], m.score));
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(desc: &str, qty: &str, price: &str, total: &str) -> ExtractedLineItem {
        ExtractedLineItem {
            description: desc.into(),
            quantity: Decimal::parse(qty).unwrap(),
            unit_price: Decimal::parse(price).unwrap(),
            total: Decimal::parse(total).unwrap(),
            part_number: None,
            citation: None,
        }
    }

    fn doc(kind: DocumentKind, items: Vec<ExtractedLineItem>, subtotal: &str, tax: &str, total: &str) -> ExtractedDocument {
        ExtractedDocument {
            document_id: format!("{}-1", kind.as_str()),
            kind,
            vendor_name: "Acme".into(),
            document_number: "N-1".into(),
            document_date: "2026-05-01".into(),
            currency: "USD".into(),
            line_items: items,
            subtotal: Decimal::parse(subtotal).unwrap(),
            tax: Decimal::parse(tax).unwrap(),
            grand_total: Decimal::parse(total).unwrap(),
            subtotal_citation: None,
            tax_citation: None,
            grand_total_citation: None,
            degraded: false,
        }
    }

    #[test]
    fn consistent_document_produces_no_flags() {
        let mut flags = Vec::new();
        check_document(
            &doc(
                DocumentKind::Po,
                vec![item("Steel bolts", "10", "50.00", "500.00")],
                "500.00",
                "0.00",
                "500.00",
            ),
            &mut flags,
        );
        assert!(flags.is_empty(), "{flags:?}");
    }

    #[test]
    fn one_cent_line_discrepancy_is_flagged() {
        let mut flags = Vec::new();
        check_document(
            &doc(
                DocumentKind::Invoice,
                vec![item("Steel bolts", "10", "50.00", "500.01")],
                "500.01",
                "0.00",
                "500.01",
            ),
            &mut flags,
        );
        assert!(flags.iter().any(|f| f.kind == FlagKind::LineArithmetic));
    }

    #[test]
    fn sub_cent_noise_is_not_flagged() {
        // 3 × 0.333333 = 0.999999; claimed 1.00 differs by 0.000001.
        let mut flags = Vec::new();
        check_document(
            &doc(
                DocumentKind::Po,
                vec![item("Fractional part", "3", "0.333333", "1.00")],
                "1.00",
                "0.00",
                "1.00",
            ),
            &mut flags,
        );
        assert!(!flags.iter().any(|f| f.kind == FlagKind::LineArithmetic), "{flags:?}");
    }

    #[test]
    fn nonzero_tax_invoice_is_consistent() {
        // Lines sum to the pre-tax subtotal; subtotal + tax equals the
        // grand total. Nothing may fire.
        let mut flags = Vec::new();
        check_document(
            &doc(
                DocumentKind::Invoice,
                vec![item("A", "1", "100.00", "100.00")],
                "100.00",
                "10.00",
                "110.00",
            ),
            &mut flags,
        );
        assert!(flags.is_empty(), "{flags:?}");
    }

    #[test]
    fn line_sum_vs_subtotal_mismatch_is_flagged() {
        // Lines sum to 150.00 but the document declares subtotal 155.00.
        let mut flags = Vec::new();
        check_document(
            &doc(
                DocumentKind::Invoice,
                vec![
                    item("A", "1", "100.00", "100.00"),
                    item("B", "1", "50.00", "50.00"),
                ],
                "155.00",
                "0.00",
                "155.00",
            ),
            &mut flags,
        );
        assert!(flags.iter().any(|f| f.kind == FlagKind::DocTotalArithmetic));
        // subtotal + tax equals the grand total, so composition is clean.
        assert!(!flags.iter().any(|f| f.kind == FlagKind::TaxComposition), "{flags:?}");
    }

    #[test]
    fn grand_total_error_is_composition_not_doc_total() {
        // Lines sum to the declared subtotal; only the grand total is off.
        let mut flags = Vec::new();
        check_document(
            &doc(
                DocumentKind::Invoice,
                vec![
                    item("A", "1", "100.00", "100.00"),
                    item("B", "1", "50.00", "50.00"),
                ],
                "150.00",
                "0.00",
                "155.00",
            ),
            &mut flags,
        );
        assert!(!flags.iter().any(|f| f.kind == FlagKind::DocTotalArithmetic), "{flags:?}");
        assert!(flags.iter().any(|f| f.kind == FlagKind::TaxComposition));
    }

    #[test]
    fn one_cent_tax_composition_is_flagged() {
        // subtotal 100.00 + tax 10.00 = 110.00; grand total claims 110.01.
        let mut flags = Vec::new();
        check_document(
            &doc(
                DocumentKind::Invoice,
                vec![item("A", "1", "100.00", "100.00")],
                "100.00",
                "10.00",
                "110.01",
            ),
            &mut flags,
        );
        assert!(flags.iter().any(|f| f.kind == FlagKind::TaxComposition));
        // Line sum matches the subtotal; the document total check stays quiet.
        assert!(!flags.iter().any(|f| f.kind == FlagKind::DocTotalArithmetic), "{flags:?}");
    }

    #[test]
    fn short_delivery_and_overbilling_detected() {
        let po = doc(DocumentKind::Po, vec![item("Steel bolts", "10", "50.00", "500.00")], "500.00", "0.00", "500.00");
        let grn = doc(DocumentKind::Grn, vec![item("Steel bolts", "8", "50.00", "400.00")], "400.00", "0.00", "400.00");
        let invoice = doc(DocumentKind::Invoice, vec![item("Steel bolts", "10", "50.00", "500.00")], "500.00", "0.00", "500.00");

        let mut flags = Vec::new();
        cross_document_checks(Some(&po), Some(&grn), Some(&invoice), &mut flags);

        assert!(flags.iter().any(|f| f.kind == FlagKind::ShortDelivery));
        assert!(flags.iter().any(|f| f.kind == FlagKind::Overbilling));
        assert!(!flags.iter().any(|f| f.kind == FlagKind::PriceDeviation));
    }

    #[test]
    fn price_deviation_beyond_point_one_percent() {
        let po = doc(DocumentKind::Po, vec![item("Steel bolts", "10", "50.00", "500.00")], "500.00", "0.00", "500.00");
        let invoice = doc(DocumentKind::Invoice, vec![item("Steel bolts", "10", "50.50", "505.00")], "505.00", "0.00", "505.00");

        let mut flags = Vec::new();
        cross_document_checks(Some(&po), None, Some(&invoice), &mut flags);
        assert!(flags.iter().any(|f| f.kind == FlagKind::PriceDeviation));
    }

    #[test]
    fn price_within_point_one_percent_passes() {
        let po = doc(DocumentKind::Po, vec![item("Steel bolts", "10", "50.00", "500.00")], "500.00", "0.00", "500.00");
        let invoice = doc(DocumentKind::Invoice, vec![item("Steel bolts", "10", "50.05", "500.50")], "500.50", "0.00", "500.50");

        let mut flags = Vec::new();
        cross_document_checks(Some(&po), None, Some(&invoice), &mut flags);
        assert!(!flags.iter().any(|f| f.kind == FlagKind::PriceDeviation), "{flags:?}");
    }

    #[test]
    fn unmatched_items_are_not_cross_compared() {
        let po = doc(DocumentKind::Po, vec![item("Copper wire", "5", "10.00", "50.00")], "50.00", "0.00", "50.00");
        let grn = doc(DocumentKind::Grn, vec![item("Plastic sheet", "5", "10.00", "50.00")], "50.00", "0.00", "50.00");

        let mut flags = Vec::new();
        cross_document_checks(Some(&po), Some(&grn), None, &mut flags);
        assert!(flags.is_empty());
    }

    #[test]
    fn empty_document_produces_no_flags() {
        let mut flags = Vec::new();
        check_document(
            &doc(DocumentKind::Po, vec![], "0", "0", "0"),
            &mut flags,
        );
        assert!(flags.is_empty());
    }

    #[test]
    fn part_number_override_links_renamed_items() {
        let mut po_item = item("Widget assembly rev 2", "4", "25.00", "100.00");
        po_item.part_number = Some("WA-2".into());
        let mut inv_item = item("WDG ASY", "4", "26.00", "104.00");
        inv_item.part_number = Some("wa-2".into());

        let po = doc(DocumentKind::Po, vec![po_item], "100.00", "0.00", "100.00");
        let invoice = doc(DocumentKind::Invoice, vec![inv_item], "104.00", "0.00", "104.00");

        let mut flags = Vec::new();
        cross_document_checks(Some(&po), None, Some(&invoice), &mut flags);
        // Linked via part number, and the 4% price drift is flagged.
        assert!(flags.iter().any(|f| f.kind == FlagKind::PriceDeviation));
    }
}
