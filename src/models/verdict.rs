use serde::{Deserialize, Serialize};

use super::enums::{DocumentKind, FlagKind, MatchStatus, OverallStatus, Recommendation};
use crate::decimal::Decimal;

/// One finding from the quantitative agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantFlag {
    pub kind: FlagKind,
    /// Which document the finding is anchored to, when it concerns a single one.
    #[serde(default)]
    pub document: Option<DocumentKind>,
    /// 0-based line index within that document, when line-scoped.
    #[serde(default)]
    pub line: Option<usize>,
    pub detail: String,
    /// Signed magnitude of the discrepancy, when numeric.
    #[serde(default)]
    pub delta: Option<Decimal>,
}

/// Output slot of the quantitative agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuantitativeReport {
    pub flags: Vec<QuantFlag>,
    pub math_verified: bool,
}

impl QuantitativeReport {
    pub fn has_flag(&self, kind: FlagKind) -> bool {
        self.flags.iter().any(|f| f.kind == kind)
    }

    pub fn has_blocking_flag(&self) -> bool {
        self.flags.iter().any(|f| f.kind.is_blocking())
    }
}

/// One rule evaluation from the compliance agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceFlag {
    pub rule: String,
    /// "pass" | "fail" | "warning"
    pub status: String,
    pub detail: String,
}

/// Output slot of the compliance agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComplianceReport {
    /// Risk in `[0, 10]`; higher is riskier.
    pub risk_score: f64,
    pub flags: Vec<ComplianceFlag>,
    pub policy_violations: Vec<String>,
    /// True when the evaluation was served by the deterministic fallback.
    #[serde(default)]
    pub degraded: bool,
}

/// Output slot of the divergence guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivergenceMetrics {
    pub similarity: f64,
    pub threshold: f64,
    pub alert_triggered: bool,
    /// True when either reasoning vector was produced by the deterministic
    /// fallback; alerts from degraded vectors may be suppressed by config.
    pub degraded: bool,
    /// Populated when the alert fired for a structural reason rather than a
    /// similarity shortfall (e.g. VECTOR_DEGENERATE).
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable record of the perturbations applied to the shadow stream.
    pub perturbation_summary: String,
    pub primary_digest: String,
    pub shadow_digest: String,
}

/// One reconciled triple across PO / GRN / Invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItemMatch {
    #[serde(default)]
    pub po_index: Option<usize>,
    #[serde(default)]
    pub grn_index: Option<usize>,
    #[serde(default)]
    pub invoice_index: Option<usize>,
    /// Description similarity in `[0, 100]`.
    pub description_score: f64,
    #[serde(default)]
    pub quantity_delta: Option<Decimal>,
    #[serde(default)]
    pub price_delta: Option<Decimal>,
    pub status: MatchStatus,
}

/// The reconciliation agent's final judgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub overall_status: OverallStatus,
    /// Clamped to `[0, 1]`.
    pub confidence: f64,
    pub line_item_matches: Vec<LineItemMatch>,
    /// At most five short human-readable findings.
    pub discrepancy_summary: Vec<String>,
    pub recommendation: Recommendation,
}

impl Verdict {
    /// The invariant every verdict must satisfy before leaving the pipeline:
    /// a divergence alert always escalates, and confidence stays in range.
    pub fn check_contract(&self) -> Result<(), String> {
        if self.overall_status == OverallStatus::DivergenceAlert
            && self.recommendation != Recommendation::Escalate
        {
            return Err(format!(
                "divergence_alert verdict must escalate, got {}",
                self.recommendation
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside [0, 1]", self.confidence));
        }
        if self.discrepancy_summary.len() > 5 {
            return Err(format!(
                "discrepancy summary has {} entries, max 5",
                self.discrepancy_summary.len()
            ));
        }
        Ok(())
    }
}
