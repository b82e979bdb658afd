use serde::{Deserialize, Serialize};

use crate::db::DatabaseError;

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

str_enum!(DocumentKind {
    Po => "po",
    Grn => "grn",
    Invoice => "invoice",
});

impl DocumentKind {
    pub const ALL: [DocumentKind; 3] = [Self::Po, Self::Grn, Self::Invoice];

    /// Human label used in prompts and workpaper sections.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Po => "Purchase Order",
            Self::Grn => "Goods Receipt Note",
            Self::Invoice => "Invoice",
        }
    }
}

str_enum!(Stage {
    Extraction => "extraction",
    Quantitative => "quantitative",
    Compliance => "compliance",
    DivergenceGuard => "divergence_guard",
    Reconciliation => "reconciliation",
    Drafting => "drafting",
    End => "end",
});

str_enum!(StageOutcome {
    Completed => "completed",
    Failed => "failed",
    Timeout => "timeout",
    Cancelled => "cancelled",
    Skipped => "skipped",
});

str_enum!(SessionStatus {
    Pending => "pending",
    Processing => "processing",
    Matched => "matched",
    DiscrepancyFound => "discrepancy_found",
    DivergenceAlert => "divergence_alert",
    Exception => "exception",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Processing)
    }
}

str_enum!(OverallStatus {
    FullMatch => "full_match",
    PartialMatch => "partial_match",
    Mismatch => "mismatch",
    Exception => "exception",
    DivergenceAlert => "divergence_alert",
});

str_enum!(Recommendation {
    Approve => "approve",
    Hold => "hold",
    Reject => "reject",
    Escalate => "escalate",
});

str_enum!(MatchStatus {
    FullMatch => "full_match",
    PartialMatch => "partial_match",
    Mismatch => "mismatch",
});

str_enum!(FlagKind {
    LineArithmetic => "line_arithmetic",
    DocTotalArithmetic => "doc_total_arithmetic",
    TaxComposition => "tax_composition",
    ShortDelivery => "short_delivery",
    Overbilling => "overbilling",
    PriceDeviation => "price_deviation",
});

impl FlagKind {
    /// Flags that force an overall `mismatch` verdict on their own.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Self::ShortDelivery | Self::Overbilling | Self::PriceDeviation | Self::DocTotalArithmetic
        )
    }
}

str_enum!(FeedbackOutcome {
    Correct => "correct",
    FalsePositive => "false_positive",
    FalseNegative => "false_negative",
});
