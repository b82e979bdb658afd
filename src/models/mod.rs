pub mod document;
pub mod enums;
pub mod extracted;
pub mod session;
pub mod verdict;

pub use document::{BoundingBox, Citation, Document, DocumentTotals, LineItem, ScoredChunk};
pub use enums::{
    DocumentKind, FeedbackOutcome, FlagKind, MatchStatus, OverallStatus, Recommendation,
    SessionStatus, Stage, StageOutcome,
};
pub use extracted::{ExtractedData, ExtractedDocument, ExtractedLineItem};
pub use session::{DivergenceFeedback, DivergenceRecord, RunRequest, SessionRecord};
pub use verdict::{
    ComplianceFlag, ComplianceReport, DivergenceMetrics, LineItemMatch, QuantFlag,
    QuantitativeReport, Verdict,
};
