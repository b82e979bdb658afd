//! Reconciliation agent — the three-way match and the verdict.
//!
//! The match table and the verdict are fully deterministic; the model
//! contributes nothing here. For each PO line the best GRN and Invoice
//! counterparts are resolved by token-set similarity (score ≥ 70, higher
//! score first, then lower counterparty index, each counterpart claimed at
//! most once). Leftover GRN/Invoice lines become unmatched triples.

use crate::decimal::{price_relative_tolerance, quantity_tolerance, Decimal};
use crate::error::{ErrorKind, StageError};
use crate::matching::fuzzy::{best_match, FULL_MATCH_THRESHOLD, LINK_THRESHOLD};
use crate::models::enums::{DocumentKind, MatchStatus, OverallStatus, Recommendation, Stage};
use crate::models::extracted::{ExtractedData, ExtractedLineItem};
use crate::models::verdict::{LineItemMatch, Verdict};
use crate::pipeline::PipelineContext;
use crate::state::PipelineState;

pub async fn run(_ctx: &PipelineContext, state: &mut PipelineState) -> Result<(), StageError> {
    let Some(extracted) = state.extracted.clone() else {
        state.push_error(StageError::non_fatal(
            Stage::Reconciliation,
            ErrorKind::UnavailableInput,
            "no extracted data; verdict is an exception",
        ));
        let verdict = Verdict {
            overall_status: OverallStatus::Exception,
            confidence: 0.0,
            line_item_matches: vec![],
            discrepancy_summary: vec!["reconciliation impossible: no extracted data".into()],
            recommendation: Recommendation::Escalate,
        };
        state.verdict = Some(verdict);
        return Ok(());
    };

    let matches = build_match_table(&extracted);
    let verdict = derive_verdict(state, &extracted, matches);

    if let Err(violation) = verdict.check_contract() {
        return Err(StageError::fatal(
            Stage::Reconciliation,
            ErrorKind::ContractViolation,
            violation,
        ));
    }

    tracing::info!(
        session_id = %state.session_id,
        status = verdict.overall_status.as_str(),
        confidence = verdict.confidence,
        triples = verdict.line_item_matches.len(),
        "reconciliation complete"
    );

    state.verdict = Some(verdict);
    Ok(())
}

fn items(extracted: &ExtractedData, kind: DocumentKind) -> &[ExtractedLineItem] {
    extracted.get(kind).map(|d| d.line_items.as_slice()).unwrap_or(&[])
}

/// Build the cross-document match table, PO-anchored, stable across runs.
pub fn build_match_table(extracted: &ExtractedData) -> Vec<LineItemMatch> {
    let po_items = items(extracted, DocumentKind::Po);
    let grn_items = items(extracted, DocumentKind::Grn);
    let invoice_items = items(extracted, DocumentKind::Invoice);

    let mut grn_taken = vec![false; grn_items.len()];
    let mut invoice_taken = vec![false; invoice_items.len()];
    let mut matches = Vec::new();

    for (po_index, po_item) in po_items.iter().enumerate() {
        let grn = best_match(
            &po_item.description,
            po_item.part_number.as_deref(),
            grn_items
                .iter()
                .enumerate()
                .map(|(i, g)| (i, g.description.as_str(), g.part_number.as_deref())),
            &grn_taken,
        );
        let invoice = best_match(
            &po_item.description,
            po_item.part_number.as_deref(),
            invoice_items
                .iter()
                .enumerate()
                .map(|(i, v)| (i, v.description.as_str(), v.part_number.as_deref())),
            &invoice_taken,
        );

        if let Some(m) = &grn {
            grn_taken[m.index] = true;
        }
        if let Some(m) = &invoice {
            invoice_taken[m.index] = true;
        }

        let grn_item = grn.map(|m| &grn_items[m.index]);
        let invoice_item = invoice.map(|m| &invoice_items[m.index]);

        // The triple's description score is the weaker of its resolved
        // links; an unmatched side scores zero.
        let description_score = match (&grn, &invoice) {
            (Some(g), Some(v)) => g.score.min(v.score),
            (Some(g), None) => g.score,
            (None, Some(v)) => v.score,
            (None, None) => 0.0,
        };

        let quantity_delta = invoice_item
            .or(grn_item)
            .map(|counterpart| counterpart.quantity.sub(&po_item.quantity));
        let price_delta = invoice_item.map(|inv| inv.unit_price.sub(&po_item.unit_price));

        let status = triple_status(
            description_score,
            grn.is_some() || invoice.is_some(),
            quantity_within(&quantity_delta),
            price_within(po_item, invoice_item, &price_delta),
        );

        matches.push(LineItemMatch {
            po_index: Some(po_index),
            grn_index: grn.map(|m| m.index),
            invoice_index: invoice.map(|m| m.index),
            description_score,
            quantity_delta,
            price_delta,
            status,
        });
    }

    // Counterparty lines no PO line claimed.
    for (i, taken) in grn_taken.iter().enumerate() {
        if !taken {
            matches.push(unmatched(None, Some(i), None));
        }
    }
    for (i, taken) in invoice_taken.iter().enumerate() {
        if !taken {
            matches.push(unmatched(None, None, Some(i)));
        }
    }

    matches
}

fn unmatched(po: Option<usize>, grn: Option<usize>, invoice: Option<usize>) -> LineItemMatch {
    LineItemMatch {
        po_index: po,
        grn_index: grn,
        invoice_index: invoice,
        description_score: 0.0,
        quantity_delta: None,
        price_delta: None,
        status: MatchStatus::Mismatch,
    }
}

fn quantity_within(delta: &Option<Decimal>) -> bool {
    match delta {
        // An absent counterpart is a failed quantity check, not a pass.
        None => false,
        Some(d) => d.abs().equals_within(&Decimal::zero(), &quantity_tolerance()),
    }
}

fn price_within(
    po_item: &ExtractedLineItem,
    invoice_item: Option<&ExtractedLineItem>,
    delta: &Option<Decimal>,
) -> bool {
    match (invoice_item, delta) {
        (Some(inv), Some(_)) => po_item
            .unit_price
            .within_relative(&inv.unit_price, &price_relative_tolerance()),
        _ => false,
    }
}

fn triple_status(
    description_score: f64,
    any_counterpart: bool,
    quantity_ok: bool,
    price_ok: bool,
) -> MatchStatus {
    if !any_counterpart || description_score < LINK_THRESHOLD {
        return MatchStatus::Mismatch;
    }
    let deltas_out = [quantity_ok, price_ok].iter().filter(|ok| !**ok).count();
    match deltas_out {
        0 if description_score >= FULL_MATCH_THRESHOLD => MatchStatus::FullMatch,
        0 | 1 => MatchStatus::PartialMatch,
        _ => MatchStatus::Mismatch,
    }
}

/// Deterministic verdict derivation over the match table, the quantitative
/// flags, the compliance risk and the divergence outcome.
fn derive_verdict(
    state: &PipelineState,
    extracted: &ExtractedData,
    matches: Vec<LineItemMatch>,
) -> Verdict {
    let quant = state.quantitative.as_ref();
    let compliance = state.compliance.as_ref();
    let divergence = state.divergence.as_ref();

    let risk_score = compliance.map(|c| c.risk_score).unwrap_or(5.0);
    let any_mismatch = matches.iter().any(|m| m.status == MatchStatus::Mismatch);
    let any_partial = matches.iter().any(|m| m.status == MatchStatus::PartialMatch);
    let blocking_flag = quant.map(|q| q.has_blocking_flag()).unwrap_or(false);
    let soft_flag = quant.map(|q| !q.flags.is_empty()).unwrap_or(false);
    let nothing_to_match = DocumentKind::ALL
        .iter()
        .all(|k| items(extracted, *k).is_empty());

    let (overall_status, recommendation) = if state.divergence_alert() {
        (OverallStatus::DivergenceAlert, Recommendation::Escalate)
    } else if nothing_to_match {
        (OverallStatus::Exception, Recommendation::Escalate)
    } else if any_mismatch || blocking_flag {
        let recommendation = if risk_score >= 7.0 {
            Recommendation::Reject
        } else {
            Recommendation::Hold
        };
        (OverallStatus::Mismatch, recommendation)
    } else if any_partial || soft_flag {
        (OverallStatus::PartialMatch, Recommendation::Hold)
    } else {
        (OverallStatus::FullMatch, Recommendation::Approve)
    };

    let discrepancy_summary = summarize(state, &matches);
    let confidence = confidence_for(&matches, divergence.map(|d| d.similarity), risk_score);

    Verdict {
        overall_status,
        confidence,
        line_item_matches: matches,
        discrepancy_summary,
        recommendation,
    }
}

/// Up to five short findings, flags first, then match-table anomalies.
fn summarize(state: &PipelineState, matches: &[LineItemMatch]) -> Vec<String> {
    let mut findings = Vec::new();

    if let Some(quant) = &state.quantitative {
        for flag in &quant.flags {
            findings.push(flag.detail.clone());
        }
    }

    let unmatched = matches.iter().filter(|m| m.po_index.is_none()).count();
    if unmatched > 0 {
        findings.push(format!(
            "{unmatched} line(s) on GRN/Invoice have no purchase order counterpart"
        ));
    }

    let mismatched = matches
        .iter()
        .filter(|m| m.po_index.is_some() && m.status == MatchStatus::Mismatch)
        .count();
    if mismatched > 0 {
        findings.push(format!("{mismatched} purchase order line(s) failed to reconcile"));
    }

    if let Some(compliance) = &state.compliance {
        for violation in &compliance.policy_violations {
            findings.push(violation.clone());
        }
    }

    findings.truncate(5);
    findings
}

/// Weighted confidence: description agreement 0.5, divergence similarity
/// 0.3, compliance headroom 0.2; clamped to [0, 1].
fn confidence_for(matches: &[LineItemMatch], similarity: Option<f64>, risk_score: f64) -> f64 {
    let description_term = if matches.is_empty() {
        0.0
    } else {
        matches.iter().map(|m| m.description_score / 100.0).sum::<f64>() / matches.len() as f64
    };
    let similarity_term = similarity.unwrap_or(0.0).max(0.0);
    let risk_term = 1.0 - (risk_score / 10.0).clamp(0.0, 1.0);

    (0.5 * description_term + 0.3 * similarity_term + 0.2 * risk_term).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::extracted::ExtractedDocument;
    use crate::models::verdict::{DivergenceMetrics, QuantFlag, QuantitativeReport};
    use crate::models::enums::FlagKind;

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

    fn doc(kind: DocumentKind, items: Vec<ExtractedLineItem>) -> ExtractedDocument {
        ExtractedDocument {
            document_id: format!("{}-1", kind.as_str()),
            kind,
            vendor_name: "Acme".into(),
            document_number: "N-1".into(),
            document_date: "2026-05-01".into(),
            currency: "USD".into(),
            line_items: items,
            subtotal: Decimal::zero(),
            tax: Decimal::zero(),
            grand_total: Decimal::zero(),
            subtotal_citation: None,
            tax_citation: None,
            grand_total_citation: None,
            degraded: false,
        }
    }

    fn three_docs(po: Vec<ExtractedLineItem>, grn: Vec<ExtractedLineItem>, inv: Vec<ExtractedLineItem>) -> ExtractedData {
        let mut data = ExtractedData::default();
        data.set(DocumentKind::Po, doc(DocumentKind::Po, po));
        data.set(DocumentKind::Grn, doc(DocumentKind::Grn, grn));
        data.set(DocumentKind::Invoice, doc(DocumentKind::Invoice, inv));
        data
    }

    #[test]
    fn perfect_triple_is_full_match() {
        let data = three_docs(
            vec![item("Steel bolts M8", "10", "50.00", "500.00")],
            vec![item("Steel bolts M8", "10", "50.00", "500.00")],
            vec![item("Steel bolts M8", "10", "50.00", "500.00")],
        );
        let table = build_match_table(&data);
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].status, MatchStatus::FullMatch);
        assert_eq!(table[0].description_score, 100.0);
        assert_eq!(table[0].po_index, Some(0));
        assert_eq!(table[0].grn_index, Some(0));
        assert_eq!(table[0].invoice_index, Some(0));
    }

    #[test]
    fn quantity_shortfall_is_partial() {
        let data = three_docs(
            vec![item("Steel bolts M8", "10", "50.00", "500.00")],
            vec![item("Steel bolts M8", "8", "50.00", "400.00")],
            vec![item("Steel bolts M8", "10", "50.00", "500.00")],
        );
        let table = build_match_table(&data);
        // Invoice quantity matches PO; delta prefers the invoice side.
        assert_eq!(table[0].quantity_delta, Some(Decimal::zero()));
        assert_eq!(table[0].status, MatchStatus::FullMatch);
    }

    #[test]
    fn price_drift_marks_partial() {
        let data = three_docs(
            vec![item("Steel bolts M8", "10", "50.00", "500.00")],
            vec![item("Steel bolts M8", "10", "50.00", "500.00")],
            vec![item("Steel bolts M8", "10", "50.50", "505.00")],
        );
        let table = build_match_table(&data);
        assert_eq!(table[0].status, MatchStatus::PartialMatch);
        assert_eq!(table[0].price_delta, Some(Decimal::parse("0.50").unwrap()));
    }

    #[test]
    fn unrelated_descriptions_are_mismatch() {
        let data = three_docs(
            vec![item("Copper wire", "10", "50.00", "500.00")],
            vec![item("Plastic sheets", "10", "50.00", "500.00")],
            vec![item("Rubber gaskets", "10", "50.00", "500.00")],
        );
        let table = build_match_table(&data);
        // PO line has no counterpart ≥ 70, and both counterparty lines are
        // left over as their own unmatched triples.
        assert_eq!(table.len(), 3);
        assert!(table.iter().all(|m| m.status == MatchStatus::Mismatch));
    }

    #[test]
    fn empty_po_leaves_all_counterparts_unmatched() {
        let data = three_docs(
            vec![],
            vec![item("Steel bolts", "10", "50.00", "500.00")],
            vec![item("Steel bolts", "10", "50.00", "500.00")],
        );
        let table = build_match_table(&data);
        assert_eq!(table.len(), 2);
        assert!(table.iter().all(|m| m.po_index.is_none()));
        assert!(table.iter().all(|m| m.status == MatchStatus::Mismatch));
    }

    #[test]
    fn each_counterpart_claimed_once() {
        let data = three_docs(
            vec![
                item("Steel bolts M8", "5", "50.00", "250.00"),
                item("Steel bolts M8", "5", "50.00", "250.00"),
            ],
            vec![item("Steel bolts M8", "5", "50.00", "250.00")],
            vec![
                item("Steel bolts M8", "5", "50.00", "250.00"),
                item("Steel bolts M8", "5", "50.00", "250.00"),
            ],
        );
        let table = build_match_table(&data);
        // Two PO lines, one GRN line: the second PO line gets no GRN.
        let grn_links: Vec<Option<usize>> = table.iter().map(|m| m.grn_index).collect();
        assert_eq!(grn_links.iter().filter(|l| l.is_some()).count(), 1);
    }

    #[test]
    fn verdict_full_match_approves_with_high_confidence() {
        let data = three_docs(
            vec![item("Steel bolts M8", "10", "50.00", "500.00")],
            vec![item("Steel bolts M8", "10", "50.00", "500.00")],
            vec![item("Steel bolts M8", "10", "50.00", "500.00")],
        );
        let mut state = PipelineState::new("s-1", "t-1");
        state.quantitative = Some(QuantitativeReport { flags: vec![], math_verified: true });
        state.compliance = Some(crate::models::verdict::ComplianceReport {
            risk_score: 0.5,
            flags: vec![],
            policy_violations: vec![],
            degraded: false,
        });
        state.divergence = Some(metrics(0.95, false));

        let verdict = derive_verdict(&state, &data, build_match_table(&data));
        assert_eq!(verdict.overall_status, OverallStatus::FullMatch);
        assert_eq!(verdict.recommendation, Recommendation::Approve);
        assert!(verdict.confidence >= 0.9, "confidence = {}", verdict.confidence);
        assert!(verdict.discrepancy_summary.is_empty());
    }

    fn metrics(similarity: f64, alert: bool) -> DivergenceMetrics {
        DivergenceMetrics {
            similarity,
            threshold: 0.85,
            alert_triggered: alert,
            degraded: false,
            reason: None,
            perturbation_summary: String::new(),
            primary_digest: String::new(),
            shadow_digest: String::new(),
        }
    }

    #[test]
    fn divergence_alert_forces_escalation() {
        let data = three_docs(
            vec![item("Steel bolts M8", "10", "50.00", "500.00")],
            vec![item("Steel bolts M8", "10", "50.00", "500.00")],
            vec![item("Steel bolts M8", "10", "50.00", "500.00")],
        );
        let mut state = PipelineState::new("s-1", "t-1");
        state.divergence = Some(metrics(0.40, true));

        let verdict = derive_verdict(&state, &data, build_match_table(&data));
        assert_eq!(verdict.overall_status, OverallStatus::DivergenceAlert);
        assert_eq!(verdict.recommendation, Recommendation::Escalate);
    }

    #[test]
    fn blocking_flag_forces_mismatch_and_risk_escalates_to_reject() {
        let data = three_docs(
            vec![item("Steel bolts M8", "10", "50.00", "500.00")],
            vec![item("Steel bolts M8", "8", "50.00", "400.00")],
            vec![item("Steel bolts M8", "10", "50.00", "500.00")],
        );
        let mut state = PipelineState::new("s-1", "t-1");
        state.quantitative = Some(QuantitativeReport {
            flags: vec![QuantFlag {
                kind: FlagKind::ShortDelivery,
                document: Some(DocumentKind::Grn),
                line: None,
                detail: "ordered 10, received 8".into(),
                delta: None,
            }],
            math_verified: false,
        });

        // Risk below 7 → hold.
        state.compliance = Some(crate::models::verdict::ComplianceReport {
            risk_score: 3.0,
            flags: vec![],
            policy_violations: vec![],
            degraded: false,
        });
        let verdict = derive_verdict(&state, &data, build_match_table(&data));
        assert_eq!(verdict.overall_status, OverallStatus::Mismatch);
        assert_eq!(verdict.recommendation, Recommendation::Hold);

        // Risk at 7 → reject.
        state.compliance.as_mut().unwrap().risk_score = 7.0;
        let verdict = derive_verdict(&state, &data, build_match_table(&data));
        assert_eq!(verdict.recommendation, Recommendation::Reject);
    }

    #[test]
    fn soft_flags_alone_are_partial_match() {
        let data = three_docs(
            vec![item("Steel bolts M8", "10", "50.00", "500.00")],
            vec![item("Steel bolts M8", "10", "50.00", "500.00")],
            vec![item("Steel bolts M8", "10", "50.00", "500.00")],
        );
        let mut state = PipelineState::new("s-1", "t-1");
        state.quantitative = Some(QuantitativeReport {
            flags: vec![QuantFlag {
                kind: FlagKind::LineArithmetic,
                document: Some(DocumentKind::Invoice),
                line: Some(0),
                detail: "10 × 50.00 = 500.00, document claims 500.02".into(),
                delta: None,
            }],
            math_verified: false,
        });

        let verdict = derive_verdict(&state, &data, build_match_table(&data));
        assert_eq!(verdict.overall_status, OverallStatus::PartialMatch);
        assert_eq!(verdict.recommendation, Recommendation::Hold);
        assert_eq!(verdict.discrepancy_summary.len(), 1);
    }

    #[test]
    fn summary_is_capped_at_five() {
        let data = three_docs(vec![], vec![], vec![]);
        let mut state = PipelineState::new("s-1", "t-1");
        state.quantitative = Some(QuantitativeReport {
            flags: (0..8)
                .map(|i| QuantFlag {
                    kind: FlagKind::LineArithmetic,
                    document: None,
                    line: Some(i),
                    detail: format!("finding {i}"),
                    delta: None,
                })
                .collect(),
            math_verified: false,
        });
        let verdict = derive_verdict(&state, &data, build_match_table(&data));
        assert_eq!(verdict.discrepancy_summary.len(), 5);
    }

    #[test]
    fn all_empty_documents_are_an_exception() {
        let data = three_docs(vec![], vec![], vec![]);
        let state = PipelineState::new("s-1", "t-1");
        let verdict = derive_verdict(&state, &data, build_match_table(&data));
        assert_eq!(verdict.overall_status, OverallStatus::Exception);
        assert_eq!(verdict.recommendation, Recommendation::Escalate);
    }

    #[test]
    fn confidence_weights_compose() {
        let matches = vec![LineItemMatch {
            po_index: Some(0),
            grn_index: Some(0),
            invoice_index: Some(0),
            description_score: 100.0,
            quantity_delta: Some(Decimal::zero()),
            price_delta: Some(Decimal::zero()),
            status: MatchStatus::FullMatch,
        }];
        // 0.5·1.0 + 0.3·1.0 + 0.2·1.0 = 1.0
        assert!((confidence_for(&matches, Some(1.0), 0.0) - 1.0).abs() < 1e-9);
        // No divergence data: the similarity term contributes nothing.
        assert!((confidence_for(&matches, None, 0.0) - 0.7).abs() < 1e-9);
        // Risk 10 zeroes the compliance headroom.
        assert!((confidence_for(&matches, Some(1.0), 10.0) - 0.8).abs() < 1e-9);
    }
}
