//! Ordered-failover LLM router.
//!
//! Providers are tried in configuration order. A provider fails the current
//! call on transport error, 5xx, 429 after the retry budget, wall-clock
//! timeout, or malformed payload — then the next provider gets the call.
//! The terminal deterministic provider never fails, so every call completes
//! even during a full upstream outage; serving from it is reported as
//! degraded so the caller can record `UPSTREAM_UNAVAILABLE`.
//!
//! The router is stateless across calls; a process-wide semaphore caps
//! concurrent outbound calls.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;

use super::json::extract_json;
use super::provider::{CompletionRequest, LlmProvider, ProviderError};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Wall-clock budget per provider attempt.
    pub provider_timeout: Duration,
    /// Extra attempts against the same provider after a 429.
    pub max_retries: u32,
    /// Base for exponential backoff between rate-limit retries.
    pub backoff_base: Duration,
    /// Process-wide ceiling on concurrent outbound calls.
    pub max_concurrent_calls: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(60),
            max_retries: 2,
            backoff_base: Duration::from_millis(200),
            max_concurrent_calls: 8,
        }
    }
}

/// A routed result with its provenance.
#[derive(Debug, Clone)]
pub struct Routed<T> {
    pub value: T,
    pub provider: String,
    /// True when the terminal provider served this call after the
    /// non-terminal chain was exhausted.
    pub degraded: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("all providers failed; last error: {0}")]
    Exhausted(String),
    #[error("router has no providers")]
    Empty,
}

pub struct LlmRouter {
    providers: Vec<Arc<dyn LlmProvider>>,
    semaphore: Arc<Semaphore>,
    config: RouterConfig,
}

impl LlmRouter {
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>, config: RouterConfig) -> Result<Self, RouterError> {
        if providers.is_empty() {
            return Err(RouterError::Empty);
        }
        tracing::info!(
            chain = ?providers.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
            timeout_secs = config.provider_timeout.as_secs(),
            "llm router initialized"
        );
        Ok(Self {
            providers,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_calls)),
            config,
        })
    }

    /// Dimension of reasoning vectors from the terminal provider — the
    /// dimension the pipeline can always rely on.
    pub fn vector_dimension(&self) -> usize {
        self.providers
            .iter()
            .rev()
            .find(|p| p.is_terminal())
            .or(self.providers.last())
            .map(|p| p.vector_dimension())
            .unwrap_or(0)
    }

    fn has_non_terminal(&self) -> bool {
        self.providers.iter().any(|p| !p.is_terminal())
    }

    /// Complete a request through the chain. With `json_mode`, a response
    /// that does not contain a parseable JSON value fails that provider's
    /// attempt.
    pub async fn complete(&self, req: &CompletionRequest) -> Result<Routed<String>, RouterError> {
        let _permit = self.semaphore.acquire().await.expect("semaphore closed");
        let mut last_error = String::from("no providers tried");
        let mut non_terminal_failed = false;

        for provider in &self.providers {
            match self.attempt_complete(provider.as_ref(), req).await {
                Ok(text) => {
                    let degraded = provider.is_terminal() && non_terminal_failed;
                    tracing::debug!(provider = provider.name(), degraded, "completion served");
                    return Ok(Routed {
                        value: text,
                        provider: provider.name().to_string(),
                        degraded,
                    });
                }
                Err(e) => {
                    if !provider.is_terminal() {
                        non_terminal_failed = true;
                    }
                    tracing::warn!(provider = provider.name(), error = %e, "provider failed");
                    last_error = format!("{}: {e}", provider.name());
                }
            }
        }
        Err(RouterError::Exhausted(last_error))
    }

    /// Complete and extract the first balanced JSON value.
    pub async fn complete_json(
        &self,
        req: &CompletionRequest,
    ) -> Result<Routed<serde_json::Value>, RouterError> {
        let routed = self.complete(req).await?;
        // complete() already validated extractability for json_mode requests,
        // so this parse cannot fail for responses it returned.
        let value = extract_json(&routed.value)
            .map_err(|e| RouterError::Exhausted(format!("json extraction: {e}")))?;
        Ok(Routed {
            value,
            provider: routed.provider,
            degraded: routed.degraded,
        })
    }

    /// Obtain a reasoning vector through the chain.
    pub async fn reasoning_vector(&self, prompt: &str) -> Result<Routed<Vec<f32>>, RouterError> {
        let _permit = self.semaphore.acquire().await.expect("semaphore closed");
        let mut last_error = String::from("no providers tried");
        let mut non_terminal_failed = false;

        for provider in &self.providers {
            match self.attempt_vector(provider.as_ref(), prompt).await {
                Ok(vector) => {
                    let degraded = provider.is_terminal() && non_terminal_failed;
                    return Ok(Routed {
                        value: vector,
                        provider: provider.name().to_string(),
                        degraded,
                    });
                }
                Err(e) => {
                    if !provider.is_terminal() {
                        non_terminal_failed = true;
                    }
                    tracing::warn!(provider = provider.name(), error = %e, "vector provider failed");
                    last_error = format!("{}: {e}", provider.name());
                }
            }
        }
        Err(RouterError::Exhausted(last_error))
    }

    /// One provider, with the retry budget for rate limiting and the
    /// per-attempt wall clock.
    async fn attempt_complete(
        &self,
        provider: &dyn LlmProvider,
        req: &CompletionRequest,
    ) -> Result<String, ProviderError> {
        let mut attempt = 0u32;
        loop {
            let result = tokio::time::timeout(self.config.provider_timeout, provider.complete(req))
                .await
                .map_err(|_| ProviderError::Timeout(self.config.provider_timeout))
                .and_then(|inner| inner);

            match result {
                Ok(text) => {
                    if req.json_mode {
                        if let Err(e) = extract_json(&text) {
                            return Err(ProviderError::Malformed(e.to_string()));
                        }
                    }
                    return Ok(text);
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    tracing::debug!(
                        provider = provider.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt_vector(
        &self,
        provider: &dyn LlmProvider,
        prompt: &str,
    ) -> Result<Vec<f32>, ProviderError> {
        let mut attempt = 0u32;
        loop {
            let result = tokio::time::timeout(
                self.config.provider_timeout,
                provider.reasoning_vector(prompt),
            )
            .await
            .map_err(|_| ProviderError::Timeout(self.config.provider_timeout))
            .and_then(|inner| inner);

            match result {
                Ok(vector) => return Ok(vector),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `base * 2^attempt`, jittered ±20%.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base.as_millis() as f64 * 2f64.powi(attempt as i32);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::from_millis((base * jitter) as u64)
    }

    /// Whether a degraded response should be recorded as UPSTREAM_UNAVAILABLE:
    /// only meaningful when a non-terminal chain exists at all.
    pub fn reports_outage(&self) -> bool {
        self.has_non_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::deterministic::DeterministicProvider;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Provider that fails a configurable number of times, then succeeds.
    struct FlakyProvider {
        name: String,
        failures: AtomicU32,
        error_factory: fn() -> ProviderError,
        response: String,
    }

    impl FlakyProvider {
        fn always_failing(name: &str, error_factory: fn() -> ProviderError) -> Self {
            Self {
                name: name.into(),
                failures: AtomicU32::new(u32::MAX),
                error_factory,
                response: String::new(),
            }
        }

        fn failing_n_times(name: &str, n: u32, error_factory: fn() -> ProviderError, response: &str) -> Self {
            Self {
                name: name.into(),
                failures: AtomicU32::new(n),
                error_factory,
                response: response.into(),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn vector_dimension(&self) -> usize {
            64
        }

        async fn complete(&self, _req: &CompletionRequest) -> Result<String, ProviderError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining.saturating_sub(1), Ordering::SeqCst);
                return Err((self.error_factory)());
            }
            Ok(self.response.clone())
        }

        async fn reasoning_vector(&self, _prompt: &str) -> Result<Vec<f32>, ProviderError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining.saturating_sub(1), Ordering::SeqCst);
                return Err((self.error_factory)());
            }
            Ok(vec![1.0; 64])
        }
    }

    fn router_with(providers: Vec<Arc<dyn LlmProvider>>) -> LlmRouter {
        let config = RouterConfig {
            backoff_base: Duration::from_millis(1),
            ..RouterConfig::default()
        };
        LlmRouter::new(providers, config).unwrap()
    }

    #[tokio::test]
    async fn healthy_first_provider_serves() {
        let router = router_with(vec![
            Arc::new(FlakyProvider::failing_n_times("cloud", 0, || ProviderError::RateLimited, "{\"ok\": 1}")) as Arc<dyn LlmProvider>,
            Arc::new(DeterministicProvider::default()),
        ]);
        let routed = router.complete(&CompletionRequest::json("p", "s")).await.unwrap();
        assert_eq!(routed.provider, "cloud");
        assert!(!routed.degraded);
    }

    #[tokio::test]
    async fn outage_falls_through_to_terminal_and_is_degraded() {
        let router = router_with(vec![
            Arc::new(FlakyProvider::always_failing("cloud", || ProviderError::Status {
                status: 503,
                body: "unavailable".into(),
            })) as Arc<dyn LlmProvider>,
            Arc::new(FlakyProvider::always_failing("local", || {
                ProviderError::Transport("connection refused".into())
            })),
            Arc::new(DeterministicProvider::default()),
        ]);
        let routed = router.complete(&CompletionRequest::json("total 12.00", "s")).await.unwrap();
        assert_eq!(routed.provider, "deterministic");
        assert!(routed.degraded);

        let vec_routed = router.reasoning_vector("prompt").await.unwrap();
        assert_eq!(vec_routed.provider, "deterministic");
        assert!(vec_routed.degraded);
    }

    #[tokio::test]
    async fn rate_limit_retries_then_succeeds_on_same_provider() {
        let router = router_with(vec![
            Arc::new(FlakyProvider::failing_n_times("cloud", 2, || ProviderError::RateLimited, "{\"ok\": 1}")) as Arc<dyn LlmProvider>,
            Arc::new(DeterministicProvider::default()),
        ]);
        let routed = router.complete(&CompletionRequest::json("p", "s")).await.unwrap();
        assert_eq!(routed.provider, "cloud");
        assert!(!routed.degraded);
    }

    #[tokio::test]
    async fn rate_limit_beyond_budget_fails_over() {
        let router = router_with(vec![
            Arc::new(FlakyProvider::failing_n_times("cloud", 3, || ProviderError::RateLimited, "{\"ok\": 1}")) as Arc<dyn LlmProvider>,
            Arc::new(DeterministicProvider::default()),
        ]);
        let routed = router.complete(&CompletionRequest::json("p", "s")).await.unwrap();
        assert_eq!(routed.provider, "deterministic");
        assert!(routed.degraded);
    }

    #[tokio::test]
    async fn malformed_json_fails_the_provider_attempt() {
        let router = router_with(vec![
            Arc::new(FlakyProvider::failing_n_times("cloud", 0, || ProviderError::RateLimited, "not json at all")) as Arc<dyn LlmProvider>,
            Arc::new(DeterministicProvider::default()),
        ]);
        let routed = router.complete_json(&CompletionRequest::json("p", "s")).await.unwrap();
        assert_eq!(routed.provider, "deterministic");
        assert!(routed.degraded);
    }

    #[tokio::test]
    async fn terminal_only_chain_never_degraded() {
        let router = router_with(vec![Arc::new(DeterministicProvider::default()) as Arc<dyn LlmProvider>]);
        let routed = router.complete(&CompletionRequest::json("p", "s")).await.unwrap();
        assert!(!routed.degraded);
        assert!(!router.reports_outage());
    }

    #[tokio::test]
    async fn empty_chain_rejected() {
        assert!(matches!(
            LlmRouter::new(vec![], RouterConfig::default()),
            Err(RouterError::Empty)
        ));
    }

    #[tokio::test]
    async fn vector_dimension_comes_from_terminal() {
        let router = router_with(vec![
            Arc::new(FlakyProvider::always_failing("cloud", || ProviderError::RateLimited)) as Arc<dyn LlmProvider>,
            Arc::new(DeterministicProvider::new(64)),
        ]);
        assert_eq!(router.vector_dimension(), 64);
    }
}
