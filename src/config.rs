use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Pipeline configuration. Built once and passed into the pipeline context
/// explicitly — there is no process-wide settings singleton.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub stages: StageConfig,
    pub divergence: DivergenceConfig,
    pub threshold: ThresholdConfig,
    pub extraction: ExtractionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Soft deadline for most stages, seconds.
    pub deadline_secs: u64,
    /// The divergence guard makes two reasoning calls and gets twice the budget.
    pub divergence_deadline_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivergenceConfig {
    /// Per-literal perturbation probability for the shadow stream.
    pub perturbation_probability: f64,
    /// Suppress alerts when the reasoning vectors came from the
    /// deterministic fallback: hash-derived vectors do not witness model
    /// reasoning, so a similarity shortfall from them is noise.
    pub suppress_alert_when_degraded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Global prior τ used until a tenant has enough feedback.
    pub global_prior: f64,
    pub floor: f64,
    pub ceiling: f64,
    /// Rolling feedback window per tenant.
    pub window_size: usize,
    /// Below this many samples the prior is used unchanged.
    pub min_samples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Chunks fetched from the vector store per document.
    pub retrieve_top_k: usize,
    /// Chunks kept after re-ranking.
    pub rerank_keep: usize,
    /// Cap on sanitized text handed to a prompt.
    pub max_chunk_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: StageConfig {
                deadline_secs: 60,
                divergence_deadline_secs: 120,
            },
            divergence: DivergenceConfig {
                perturbation_probability: 0.15,
                suppress_alert_when_degraded: true,
            },
            threshold: ThresholdConfig {
                global_prior: 0.85,
                floor: 0.70,
                ceiling: 0.95,
                window_size: 200,
                min_samples: 20,
            },
            extraction: ExtractionConfig {
                retrieve_top_k: 10,
                rerank_keep: 5,
                max_chunk_chars: 8_000,
            },
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stages: StageConfig {
                deadline_secs: env_u64("LM_STAGE_DEADLINE_SECS", defaults.stages.deadline_secs),
                divergence_deadline_secs: env_u64(
                    "LM_DIVERGENCE_DEADLINE_SECS",
                    defaults.stages.divergence_deadline_secs,
                ),
            },
            divergence: DivergenceConfig {
                perturbation_probability: env_f64(
                    "LM_PERTURBATION_PROBABILITY",
                    defaults.divergence.perturbation_probability,
                ),
                suppress_alert_when_degraded: env_bool(
                    "LM_SUPPRESS_DEGRADED_ALERTS",
                    defaults.divergence.suppress_alert_when_degraded,
                ),
            },
            threshold: ThresholdConfig {
                global_prior: env_f64("LM_THRESHOLD_PRIOR", defaults.threshold.global_prior),
                floor: defaults.threshold.floor,
                ceiling: defaults.threshold.ceiling,
                window_size: defaults.threshold.window_size,
                min_samples: defaults.threshold.min_samples,
            },
            extraction: defaults.extraction,
        }
    }

    pub fn stage_deadline(&self, stage: crate::models::enums::Stage) -> Duration {
        use crate::models::enums::Stage;
        match stage {
            Stage::DivergenceGuard => Duration::from_secs(self.stages.divergence_deadline_secs),
            _ => Duration::from_secs(self.stages.deadline_secs),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::enums::Stage;

    #[test]
    fn defaults_match_contract() {
        let config = PipelineConfig::default();
        assert_eq!(config.stages.deadline_secs, 60);
        assert_eq!(config.stages.divergence_deadline_secs, 120);
        assert_eq!(config.divergence.perturbation_probability, 0.15);
        assert_eq!(config.threshold.global_prior, 0.85);
        assert_eq!(config.threshold.window_size, 200);
        assert_eq!(config.threshold.min_samples, 20);
    }

    #[test]
    fn divergence_guard_gets_double_deadline() {
        let config = PipelineConfig::default();
        assert_eq!(config.stage_deadline(Stage::DivergenceGuard), Duration::from_secs(120));
        assert_eq!(config.stage_deadline(Stage::Quantitative), Duration::from_secs(60));
    }
}
