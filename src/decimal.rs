//! Exact fixed-point arithmetic for monetary and quantity values.
//!
//! Every value that is ever compared — unit prices, line totals, tax,
//! quantities — flows through [`Decimal`]. Binary floating point is not
//! allowed to carry financial values anywhere in the pipeline; `f64` only
//! appears in similarity scores and confidence weights.
//!
//! Tolerances:
//! - money: absolute `0.01` currency units
//! - price deviation: relative `0.001` (0.1%)
//! - quantity: absolute `0` (exact)

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use bigdecimal::{BigDecimal, RoundingMode, Zero};
use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Maximum fractional digits accepted from external input.
pub const MAX_FRACTION_DIGITS: usize = 6;
/// Maximum integer digits accepted from external input.
pub const MAX_INTEGER_DIGITS: usize = 15;
/// Division results are settled at this scale with banker's rounding.
const DIVISION_SCALE: i64 = 6;

/// Strict shape for external numeric input. No exponents, no separators,
/// at most 15 integer and 6 fractional digits.
static NUMERIC_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?\d{1,15}(\.\d{1,6})?$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecimalError {
    #[error("PARSE_ERROR: `{0}` is not an exact fixed-point value")]
    Parse(String),
    #[error("division by zero")]
    DivisionByZero,
}

/// Exact fixed-point value. Wraps an arbitrary-precision decimal; all
/// construction from external input goes through [`Decimal::parse`], which
/// rejects anything that would lose precision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Decimal(BigDecimal);

impl Decimal {
    /// Parse external input strictly.
    ///
    /// Rejects exponent notation, thousands separators, more than
    /// [`MAX_FRACTION_DIGITS`] fractional digits or more than
    /// [`MAX_INTEGER_DIGITS`] integer digits.
    pub fn parse(input: &str) -> Result<Self, DecimalError> {
        let trimmed = input.trim();
        if !NUMERIC_SHAPE.is_match(trimmed) {
            return Err(DecimalError::Parse(trimmed.to_string()));
        }
        let inner = BigDecimal::from_str(trimmed)
            .map_err(|_| DecimalError::Parse(trimmed.to_string()))?;
        Ok(Self(inner))
    }

    pub fn zero() -> Self {
        Self(BigDecimal::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.0 < BigDecimal::zero()
    }

    pub fn add(&self, other: &Self) -> Self {
        Self(&self.0 + &other.0)
    }

    pub fn sub(&self, other: &Self) -> Self {
        Self(&self.0 - &other.0)
    }

    pub fn mul(&self, other: &Self) -> Self {
        Self(&self.0 * &other.0)
    }

    /// Division settled at six fractional digits, banker's rounding.
    pub fn div(&self, other: &Self) -> Result<Self, DecimalError> {
        if other.0.is_zero() {
            return Err(DecimalError::DivisionByZero);
        }
        let raw = &self.0 / &other.0;
        Ok(Self(raw.with_scale_round(DIVISION_SCALE, RoundingMode::HalfEven)))
    }

    pub fn abs(&self) -> Self {
        Self(self.0.abs())
    }

    /// `|a - b| <= abs_tol`. The equality gate for monetary totals.
    pub fn equals_within(&self, other: &Self, abs_tol: &Self) -> bool {
        self.sub(other).abs().0 <= abs_tol.0
    }

    /// `|a - b| / |a| <= rel_tol`, with `a` as the reference value.
    /// A zero reference only matches a zero candidate.
    pub fn within_relative(&self, other: &Self, rel_tol: &Self) -> bool {
        if self.0.is_zero() {
            return other.0.is_zero();
        }
        let deviation = self.sub(other).abs();
        let bound = self.abs().mul(rel_tol);
        deviation.0 <= bound.0
    }

    /// Render without exponent, preserving the stored scale.
    pub fn to_plain_string(&self) -> String {
        self.0.to_plain_string()
    }
}

/// Absolute tolerance for money comparisons: one cent.
pub fn money_tolerance() -> Decimal {
    Decimal(BigDecimal::from_str("0.01").unwrap())
}

/// Relative tolerance for unit-price deviation: 0.1%.
pub fn price_relative_tolerance() -> Decimal {
    Decimal(BigDecimal::from_str("0.001").unwrap())
}

/// Quantity comparisons are exact.
pub fn quantity_tolerance() -> Decimal {
    Decimal::zero()
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_plain_string())
    }
}

impl Serialize for Decimal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_plain_string())
    }
}

impl<'de> Deserialize<'de> for Decimal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Decimal::parse(&s).map_err(D::Error::custom)
    }
}
