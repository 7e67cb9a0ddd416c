//! Embedding provider abstraction and the OpenAI-compatible implementation.
//!
//! - **[`DisabledProvider`]** fails every call; used when
//!   `embedding.provider = "disabled"`.
//! - **[`OpenAIProvider`]** calls `POST {base_url}/embeddings`.
//!
//! Providers make exactly one request per call. Retrying is layered on top
//! by [`embed_with_retry`], driven by a [`RetryPolicy`].
//!
//! # Retry Strategy
//!
//! - HTTP 429, HTTP 5xx and transport failures are retried.
//! - Any other failure (4xx, malformed response) fails immediately.
//! - The delay is the provider's hint (`retry-after-ms`, then
//!   `retry-after`, at least 1 s) when given, else
//!   `min(max_delay, attempt² × base_delay)`, plus up to 400 ms of jitter.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::config::{openai_api_key, EmbeddingConfig};

/// Failure of a single provider request.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider returned HTTP {status}: {message}")]
    Http {
        status: u16,
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("request to provider failed: {0}")]
    Transport(String),
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    #[error("embedding provider is disabled")]
    Disabled,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http { status, .. } => *status == 429 || (500..600).contains(status),
            ProviderError::Transport(_) => true,
            ProviderError::InvalidResponse(_) | ProviderError::Disabled => false,
        }
    }

    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            ProviderError::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier recorded on every stored vector.
    fn model_name(&self) -> &str;

    /// Embed `texts`, returning one vector per input in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::Disabled)
    }
}

pub struct OpenAIProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        })
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// Parse a provider-supplied retry delay, clamped to at least one second.
/// Values too large to represent are ignored.
pub fn parse_retry_hint(headers: &HeaderMap) -> Option<Duration> {
    let header_f64 = |name: &str| -> Option<f64> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
    };
    let hint = header_f64("retry-after-ms")
        .map(|ms| Duration::from_millis(ms as u64))
        .or_else(|| {
            header_f64("retry-after").and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        })?;
    Some(hint.max(Duration::from_secs(1)))
}

/// Order response items by their `index` field when every item has one.
fn vectors_in_request_order(
    mut items: Vec<EmbeddingItem>,
    expected: usize,
) -> Result<Vec<Vec<f32>>, ProviderError> {
    if items.len() != expected {
        return Err(ProviderError::InvalidResponse(format!(
            "expected {expected} embeddings, got {}",
            items.len()
        )));
    }
    if items.iter().all(|i| i.index.is_some()) {
        items.sort_by_key(|i| i.index);
    }
    Ok(items.into_iter().map(|i| i.embedding).collect())
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_hint(response.headers());
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                retry_after,
                message,
            });
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        vectors_in_request_order(parsed.data, texts.len())
    }
}

/// Bounded retry schedule shared by the backfill and query embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_jitter: Duration::from_millis(400),
        }
    }

    /// Delay after `attempt` (1-based) failed, before adding jitter.
    /// Provider hints are capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        match hint {
            Some(h) => h.min(self.max_delay),
            None => {
                let factor = u32::try_from(u64::from(attempt).pow(2)).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor).min(self.max_delay)
            }
        }
    }

    fn jitter(&self) -> Duration {
        let max = self.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EmbeddingConfig::default())
    }
}

/// Call `provider.embed` with retries for transient failures.
pub async fn embed_with_retry(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    policy: &RetryPolicy,
) -> Result<Vec<Vec<f32>>> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match provider.embed(texts).await {
            Ok(vectors) => return Ok(vectors),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt, e.retry_hint()) + policy.jitter();
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "embedding request failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("embedding failed after {attempt} attempt(s)"))
            }
        }
    }
}

/// Embed a single query string.
pub async fn embed_query(
    provider: &dyn EmbeddingProvider,
    text: &str,
    policy: &RetryPolicy,
) -> Result<Vec<f32>> {
    embed_with_retry(provider, &[text.to_string()], policy)
        .await?
        .into_iter()
        .next()
        .context("provider returned no embedding for the query")
}

/// Build the configured provider. `openai` requires `OPENAI_API_KEY`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config, openai_api_key()?)?)),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}
