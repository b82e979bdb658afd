//! Compliance agent — policy rules over the reconciled transaction.
//!
//! The duplicate-invoice and vendor-known checks run deterministically
//! against the provided history probes; the model evaluates the judgement
//! rules (payment terms, tax sanity, authorization shape) on top. The
//! model's numeric claims are never trusted: a "fail" that asserts an
//! arithmetic problem survives only if the quantitative agent found one.

use serde_json::Value;

use crate::error::{ErrorKind, StageError};
use crate::llm::CompletionRequest;
use crate::models::enums::{DocumentKind, Stage};
use crate::models::verdict::{ComplianceFlag, ComplianceReport};
use crate::pipeline::PipelineContext;
use crate::sanitize::sanitize_document_text;
use crate::state::PipelineState;

const SYSTEM_PROMPT: &str = "You are a senior financial compliance auditor. \
Evaluate the transaction against the stated rules. Respond with valid JSON only.";

/// Rule names whose failures make an arithmetic claim and therefore need
/// quantitative corroboration.
const NUMERIC_RULES: [&str; 3] = ["tax_computation", "total_consistency", "line_count_parity"];

pub async fn run(ctx: &PipelineContext, state: &mut PipelineState) -> Result<(), StageError> {
    let Some(extracted) = state.extracted.as_ref() else {
        state.push_error(StageError::non_fatal(
            Stage::Compliance,
            ErrorKind::UnavailableInput,
            "no extracted data; compliance evaluated with neutral defaults",
        ));
        state.compliance = Some(ComplianceReport {
            risk_score: 5.0,
            flags: vec![],
            policy_violations: vec!["compliance evaluation skipped: no extracted data".into()],
            degraded: true,
        });
        return Ok(());
    };

    let invoice = extracted.get(DocumentKind::Invoice);
    let po = extracted.get(DocumentKind::Po);

    // Deterministic signals first.
    let mut flags = Vec::new();
    if let Some(inv) = invoice {
        let number = inv.document_number.trim();
        let duplicate = !number.is_empty()
            && ctx
                .probe
                .known_invoice_numbers
                .iter()
                .any(|n| n.trim().eq_ignore_ascii_case(number));
        flags.push(ComplianceFlag {
            rule: "duplicate_invoice".into(),
            status: if duplicate { "fail" } else { "pass" }.into(),
            detail: if duplicate {
                format!("invoice number {number} was already processed")
            } else {
                "invoice number not seen before".into()
            },
        });

        let vendor = inv.vendor_name.trim();
        let known = !vendor.is_empty()
            && ctx
                .probe
                .known_vendors
                .iter()
                .any(|v| v.trim().eq_ignore_ascii_case(vendor));
        flags.push(ComplianceFlag {
            rule: "vendor_known".into(),
            status: if known { "pass" } else { "warning" }.into(),
            detail: if known {
                "vendor present in master data".into()
            } else {
                format!("vendor `{vendor}` not found in master data")
            },
        });
    }

    // Model-evaluated rules.
    let context_json = build_context(po, invoice, state);
    let prompt = compliance_prompt(&context_json);
    match ctx.router.complete_json(&CompletionRequest::json(prompt, SYSTEM_PROMPT)).await {
        Ok(routed) => {
            let mut report = parse_report(&routed.value);
            report.degraded = routed.degraded;
            if routed.degraded {
                state.push_error(StageError::non_fatal(
                    Stage::Compliance,
                    ErrorKind::UpstreamUnavailable,
                    "compliance evaluation served by deterministic fallback",
                ));
            }

            cross_check_numeric_claims(&mut report, state);
            report.flags.splice(0..0, flags);
            state.compliance = Some(report);
        }
        Err(e) => {
            state.push_error(StageError::non_fatal(
                Stage::Compliance,
                ErrorKind::UpstreamUnavailable,
                e.to_string(),
            ));
            state.compliance = Some(ComplianceReport {
                risk_score: 5.0,
                flags,
                policy_violations: vec!["automated compliance evaluation failed".into()],
                degraded: true,
            });
        }
    }

    Ok(())
}

fn build_context(
    po: Option<&crate::models::extracted::ExtractedDocument>,
    invoice: Option<&crate::models::extracted::ExtractedDocument>,
    state: &PipelineState,
) -> String {
    let field = |s: &str| sanitize_document_text(s, 200).cleaned_text;
    let quant_flags: Vec<String> = state
        .quantitative
        .as_ref()
        .map(|q| q.flags.iter().map(|f| f.kind.as_str().to_string()).collect())
        .unwrap_or_default();

    serde_json::json!({
        "po_number": po.map(|d| field(&d.document_number)),
        "po_date": po.map(|d| field(&d.document_date)),
        "po_total": po.map(|d| d.grand_total.to_plain_string()),
        "po_line_count": po.map(|d| d.line_items.len()),
        "vendor_on_po": po.map(|d| field(&d.vendor_name)),
        "invoice_number": invoice.map(|d| field(&d.document_number)),
        "invoice_date": invoice.map(|d| field(&d.document_date)),
        "invoice_total": invoice.map(|d| d.grand_total.to_plain_string()),
        "invoice_tax": invoice.map(|d| d.tax.to_plain_string()),
        "invoice_line_count": invoice.map(|d| d.line_items.len()),
        "vendor_on_invoice": invoice.map(|d| field(&d.vendor_name)),
        "quantitative_flags": quant_flags,
    })
    .to_string()
}

fn compliance_prompt(context: &str) -> String {
    format!(
        "Evaluate this transaction for compliance.\n\n\
         Transaction Data:\n{context}\n\n\
         Rules to evaluate:\n\
         1. vendor_match: vendor on the invoice matches the purchase order\n\
         2. tax_computation: the applied tax is plausible for the jurisdiction\n\
         3. payment_terms: terms comply with corporate policy (max Net-90)\n\
         4. line_count_parity: the invoice has no unexplained extra lines vs the PO\n\
         5. total_consistency: document totals are internally consistent\n\n\
         Respond with JSON:\n\
         {{\n\
           \"risk_score\": 0.0,\n\
           \"flags\": [{{\"rule\": \"rule_name\", \"status\": \"pass|fail|warning\", \"detail\": \"\"}}],\n\
           \"policy_violations\": []\n\
         }}"
    )
}

fn parse_report(value: &Value) -> ComplianceReport {
    let risk_score = value
        .get("risk_score")
        .and_then(Value::as_f64)
        .unwrap_or(5.0)
        .clamp(0.0, 10.0);

    let flags = value
        .get("flags")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let rule = item.get("rule")?.as_str()?.to_string();
                    let status = item
                        .get("status")
                        .and_then(Value::as_str)
                        .unwrap_or("warning")
                        .to_string();
                    let detail = item
                        .get("detail")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    Some(ComplianceFlag { rule, status, detail })
                })
                .collect()
        })
        .unwrap_or_default();

    let policy_violations = value
        .get("policy_violations")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    ComplianceReport { risk_score, flags, policy_violations, degraded: false }
}

/// Downgrade model "fail" flags that assert arithmetic problems the
/// quantitative agent did not find.
fn cross_check_numeric_claims(report: &mut ComplianceReport, state: &PipelineState) {
    let quant_found_any = state
        .quantitative
        .as_ref()
        .map(|q| !q.flags.is_empty())
        .unwrap_or(false);

    for flag in &mut report.flags {
        let numeric = NUMERIC_RULES.contains(&flag.rule.as_str());
        if numeric && flag.status == "fail" && !quant_found_any {
            tracing::warn!(rule = %flag.rule, "numeric compliance claim lacks quantitative support, downgraded");
            flag.status = "warning".into();
            flag.detail = format!("{} (uncorroborated by arithmetic checks)", flag.detail);
        }
    }
}
