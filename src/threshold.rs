//! Adaptive divergence threshold, learned per tenant from analyst feedback.
//!
//! τ starts at the global prior (0.85). Once a tenant has at least 20
//! feedback rows, τ is recomputed as the candidate in [0.70, 0.95] (step
//! 0.01) that minimizes `false_positives + 2 × false_negatives` over the
//! rolling window — a missed divergence costs twice a false alarm. Reads
//! are O(1) through a cache; feedback invalidates the tenant's entry and
//! the next read recomputes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::ThresholdConfig;
use crate::models::enums::FeedbackOutcome;
use crate::models::session::DivergenceFeedback;
use crate::stores::FeedbackStore;

pub struct AdaptiveThresholdStore {
    config: ThresholdConfig,
    feedback: Arc<dyn FeedbackStore>,
    cache: RwLock<HashMap<String, f64>>,
}

impl AdaptiveThresholdStore {
    pub fn new(config: ThresholdConfig, feedback: Arc<dyn FeedbackStore>) -> Self {
        Self {
            config,
            feedback,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The tenant's current τ. Cached; recomputed lazily after feedback.
    pub fn threshold(&self, tenant_id: &str) -> f64 {
        if let Some(cached) = self
            .cache
            .read()
            .expect("threshold cache poisoned")
            .get(tenant_id)
        {
            return *cached;
        }

        let computed = self.recompute(tenant_id);
        self.cache
            .write()
            .expect("threshold cache poisoned")
            .insert(tenant_id.to_string(), computed);
        computed
    }

    /// Record analyst feedback and invalidate the tenant's cached τ.
    pub fn record_feedback(&self, feedback: DivergenceFeedback) {
        let tenant_id = feedback.tenant_id.clone();
        self.feedback.append(feedback);
        self.cache
            .write()
            .expect("threshold cache poisoned")
            .remove(&tenant_id);
        tracing::info!(tenant_id = %tenant_id, "divergence feedback recorded, threshold cache invalidated");
    }

    fn recompute(&self, tenant_id: &str) -> f64 {
        let rows = self.feedback.recent(tenant_id, self.config.window_size);
        if rows.len() < self.config.min_samples {
            return self.config.global_prior;
        }

        let tau = optimal_threshold(&rows, &self.config);
        tracing::info!(
            tenant_id,
            threshold = tau,
            samples = rows.len(),
            "divergence threshold recomputed"
        );
        tau
    }
}

/// Whether the session was truly divergent, given the alert decision the
/// analyst judged.
fn truly_divergent(row: &DivergenceFeedback) -> bool {
    match row.outcome {
        FeedbackOutcome::Correct => row.was_alert,
        FeedbackOutcome::FalsePositive => false,
        FeedbackOutcome::FalseNegative => true,
    }
}

/// Walk candidates in [floor, ceiling] step 0.01; cost = fp + 2·fn.
/// Ties resolve toward the candidate closest to the prior.
fn optimal_threshold(rows: &[DivergenceFeedback], config: &ThresholdConfig) -> f64 {
    let steps = ((config.ceiling - config.floor) / 0.01).round() as usize;
    let mut best_tau = config.global_prior;
    let mut best_cost = u32::MAX;

    for i in 0..=steps {
        let candidate = config.floor + i as f64 * 0.01;
        let mut cost = 0u32;
        for row in rows {
            let predicted_alert = row.similarity < candidate;
            let truth = truly_divergent(row);
            if predicted_alert && !truth {
                cost += 1; // false positive
            } else if !predicted_alert && truth {
                cost += 2; // false negative weighs double
            }
        }
        let better = cost < best_cost
            || (cost == best_cost
                && (candidate - config.global_prior).abs() < (best_tau - config.global_prior).abs());
        if better {
            best_cost = cost;
            best_tau = candidate;
        }
    }

    best_tau.clamp(config.floor, config.ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::stores::InMemoryFeedbackStore;

    fn store() -> AdaptiveThresholdStore {
        AdaptiveThresholdStore::new(
            PipelineConfig::default().threshold,
            Arc::new(InMemoryFeedbackStore::new()),
        )
    }

    fn feedback(similarity: f64, was_alert: bool, outcome: FeedbackOutcome) -> DivergenceFeedback {
        DivergenceFeedback {
            session_id: uuid::Uuid::new_v4().to_string(),
            tenant_id: "t-1".into(),
            similarity,
            threshold_used: 0.85,
            was_alert,
            outcome,
        }
    }

    #[test]
    fn few_samples_use_global_prior() {
        let s = store();
        for _ in 0..10 {
            s.record_feedback(feedback(0.5, true, FeedbackOutcome::Correct));
        }
        assert_eq!(s.threshold("t-1"), 0.85);
        assert_eq!(s.threshold("unknown-tenant"), 0.85);
    }

    #[test]
    fn repeated_false_positives_lower_tau() {
        let s = store();
        // Alerts fired between similarity 0.80 and 0.84; analysts keep
        // rejecting them. The optimal τ drops below 0.80 region costs.
        for i in 0..30 {
            let sim = 0.80 + (i % 5) as f64 * 0.01;
            s.record_feedback(feedback(sim, true, FeedbackOutcome::FalsePositive));
        }
        let tau = s.threshold("t-1");
        assert!(tau <= 0.80, "tau = {tau}");
        assert!(tau >= 0.70);
    }

    #[test]
    fn missed_divergences_raise_tau() {
        let s = store();
        // No alert fired at similarity ~0.88..0.92 but analysts flagged the
        // sessions as truly divergent — τ should climb above them.
        for i in 0..30 {
            let sim = 0.88 + (i % 5) as f64 * 0.01;
            s.record_feedback(feedback(sim, false, FeedbackOutcome::FalseNegative));
        }
        let tau = s.threshold("t-1");
        assert!(tau > 0.92, "tau = {tau}");
        assert!(tau <= 0.95);
    }

    #[test]
    fn tau_stays_clamped() {
        let s = store();
        for _ in 0..50 {
            s.record_feedback(feedback(0.99, false, FeedbackOutcome::FalseNegative));
        }
        let tau = s.threshold("t-1");
        assert!(tau <= 0.95);
    }

    #[test]
    fn cache_is_invalidated_by_feedback() {
        let s = store();
        let before = s.threshold("t-1");
        assert_eq!(before, 0.85);
        for _ in 0..25 {
            s.record_feedback(feedback(0.84, true, FeedbackOutcome::FalsePositive));
        }
        let after = s.threshold("t-1");
        assert!(after < before, "after = {after}");
    }

    #[test]
    fn correct_alerts_keep_tau_near_prior() {
        let s = store();
        // Alerts at low similarity judged correct, clear runs at high
        // similarity also judged correct.
        for _ in 0..15 {
            s.record_feedback(feedback(0.60, true, FeedbackOutcome::Correct));
            s.record_feedback(feedback(0.95, false, FeedbackOutcome::Correct));
        }
        let tau = s.threshold("t-1");
        // Any τ in (0.60, 0.95] is zero-cost; tie-break picks the prior.
        assert_eq!(tau, 0.85);
    }
}
