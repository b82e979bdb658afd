pub mod deterministic;
pub mod http;
pub mod json;
pub mod provider;
pub mod router;

pub use deterministic::DeterministicProvider;
pub use http::{HttpProvider, HttpProviderConfig};
pub use json::extract_json;
pub use provider::{CompletionRequest, LlmProvider, ProviderError};
pub use router::{LlmRouter, Routed, RouterConfig, RouterError};
