//! Per-field confidence intervals for extracted monetary values.
//!
//! Closed-form Gaussian error propagation:
//! `σ = value × (1 − extraction_confidence) × (1 + divergence_penalty)`,
//! where the penalty applies when the divergence guard fired. Three
//! two-sided intervals (90/95/99%) and a traffic-light grade derived from
//! the 95% interval width relative to the value.

use serde::{Deserialize, Serialize};

/// σ inflation applied when the divergence guard alert fired.
pub const DIVERGENCE_PENALTY: f64 = 0.20;

const Z_90: f64 = 1.645;
const Z_95: f64 = 1.960;
const Z_99: f64 = 2.576;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalGrade {
    Green,
    Amber,
    Red,
}

/// Confidence interval for a single extracted field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldInterval {
    pub field: String,
    pub value: f64,
    pub sigma: f64,
    pub lower_90: f64,
    pub upper_90: f64,
    pub lower_95: f64,
    pub upper_95: f64,
    pub lower_99: f64,
    pub upper_99: f64,
    pub grade: IntervalGrade,
}

/// Compute the interval for one field.
///
/// `extraction_confidence` is in `[0, 1]`; values outside are clamped.
pub fn field_interval(
    field: &str,
    value: f64,
    extraction_confidence: f64,
    divergence_alert: bool,
) -> FieldInterval {
    let confidence = extraction_confidence.clamp(0.0, 1.0);
    let correction = if divergence_alert { 1.0 + DIVERGENCE_PENALTY } else { 1.0 };
    let sigma = value.abs() * (1.0 - confidence) * correction;

    let grade = grade_for(value, sigma);

    FieldInterval {
        field: field.to_string(),
        value,
        sigma,
        lower_90: value - Z_90 * sigma,
        upper_90: value + Z_90 * sigma,
        lower_95: value - Z_95 * sigma,
        upper_95: value + Z_95 * sigma,
        lower_99: value - Z_99 * sigma,
        upper_99: value + Z_99 * sigma,
        grade,
    }
}

fn grade_for(value: f64, sigma: f64) -> IntervalGrade {
    if value == 0.0 {
        return if sigma == 0.0 { IntervalGrade::Green } else { IntervalGrade::Red };
    }
    let width_95 = 2.0 * Z_95 * sigma;
    let relative = width_95 / value.abs();
    if relative < 0.01 {
        IntervalGrade::Green
    } else if relative < 0.05 {
        IntervalGrade::Amber
    } else {
        IntervalGrade::Red
    }
}
