pub mod fuzzy;

pub use fuzzy::{best_match, match_score, token_set_score, ResolvedMatch};
