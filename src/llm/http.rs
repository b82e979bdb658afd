//! HTTP reasoning provider.
//!
//! Speaks the local-inference generate/embeddings API shape
//! (`POST /api/generate`, `POST /api/embeddings`). Both the cloud and the
//! local entries of the default chain are instances of this provider with
//! different base URLs and models; the router supplies timeouts and
//! failover, so the client here only carries a connect timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::provider::{CompletionRequest, LlmProvider, ProviderError};

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    /// Name used in logs and router accounting ("cloud", "local", ...).
    pub name: String,
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
    pub api_key: Option<String>,
    /// Dimension of the embeddings endpoint's output.
    pub vector_dimension: usize,
}

pub struct HttpProvider {
    config: HttpProviderConfig,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self {
            config: HttpProviderConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
            client,
        })
    }

    fn classify(err: reqwest::Error) -> ProviderError {
        if err.is_timeout() || err.is_connect() {
            ProviderError::Transport(err.to_string())
        } else {
            ProviderError::Transport(format!("request failed: {err}"))
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited);
        }
        Err(ProviderError::Status { status: status.as_u16(), body })
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    format: Option<&'a str>,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

#[async_trait]
impl LlmProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn vector_dimension(&self) -> usize {
        self.config.vector_dimension
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<String, ProviderError> {
        let url = format!("{}/api/generate", self.config.base_url);
        let body = GenerateRequest {
            model: &self.config.model,
            prompt: &req.prompt,
            system: &req.system,
            stream: false,
            format: req.json_mode.then_some("json"),
            options: GenerateOptions {
                temperature: req.temperature,
                num_predict: req.max_tokens,
            },
        };

        let response = self
            .authorize(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(Self::classify)?;
        let response = Self::check_status(response).await?;

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        Ok(parsed.response)
    }

    async fn reasoning_vector(&self, prompt: &str) -> Result<Vec<f32>, ProviderError> {
        let url = format!("{}/api/embeddings", self.config.base_url);
        let body = EmbeddingsRequest {
            model: &self.config.embedding_model,
            prompt,
        };

        let response = self
            .authorize(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(Self::classify)?;
        let response = Self::check_status(response).await?;

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        if parsed.embedding.is_empty() {
            return Err(ProviderError::Malformed("empty embedding".into()));
        }
        Ok(parsed.embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HttpProviderConfig {
        HttpProviderConfig {
            name: "local".into(),
            base_url: "http://localhost:11434/".into(),
            model: "qwen2.5:14b".into(),
            embedding_model: "nomic-embed-text".into(),
            api_key: None,
            vector_dimension: 768,
        }
    }

    #[test]
    fn trailing_slash_trimmed() {
        let provider = HttpProvider::new(config()).unwrap();
        assert_eq!(provider.config.base_url, "http://localhost:11434");
    }

    #[test]
    fn reports_configured_dimension() {
        let provider = HttpProvider::new(config()).unwrap();
        assert_eq!(provider.vector_dimension(), 768);
        assert_eq!(provider.name(), "local");
        assert!(!provider.is_terminal());
    }

    #[tokio::test]
    async fn unreachable_host_is_transport_error() {
        let mut cfg = config();
        cfg.base_url = "http://127.0.0.1:1".into();
        let provider = HttpProvider::new(cfg).unwrap();
        let err = provider
            .complete(&CompletionRequest::json("p", "s"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Transport(_)));
    }
}
