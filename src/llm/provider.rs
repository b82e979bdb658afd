//! Provider seam for the LLM router.
//!
//! A provider either answers or fails with a classified error; the router
//! owns retries, timeouts and failover. Providers are stateless from the
//! router's point of view.

use async_trait::async_trait;

/// One reasoning request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub json_mode: bool,
}

impl CompletionRequest {
    /// A deterministic JSON-mode request, the common case for agents.
    pub fn json(prompt: impl Into<String>, system: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: system.into(),
            temperature: 0.0,
            max_tokens: 2048,
            json_mode: true,
        }
    }

    /// A free-text request (workpaper narrative).
    pub fn text(prompt: impl Into<String>, system: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: system.into(),
            temperature: 0.2,
            max_tokens: 2048,
            json_mode: false,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Why a single provider attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("rate limited")]
    RateLimited,

    #[error("provider timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Only rate limiting is worth retrying against the same provider;
    /// everything else fails over immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited)
    }
}

/// A reasoning backend. Implementations: HTTP chat providers and the
/// terminal deterministic fallback.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Terminal providers must always return a result; the router places
    /// them last and treats serving from one as degraded mode.
    fn is_terminal(&self) -> bool {
        false
    }

    /// Dimension of vectors returned by `reasoning_vector`.
    fn vector_dimension(&self) -> usize;

    async fn complete(&self, req: &CompletionRequest) -> Result<String, ProviderError>;

    /// A fixed-length embedding of the model's reasoning over `prompt`.
    async fn reasoning_vector(&self, prompt: &str) -> Result<Vec<f32>, ProviderError>;
}
