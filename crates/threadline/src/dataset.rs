//! Paginated dataset client.
//!
//! Rows come from a dataset-viewer style `GET {base}/rows` endpoint, paged
//! by `offset`/`length`. [`RowSource`] abstracts the transport so the
//! ingester can be tested with an in-process fake.
//!
//! # Retry Strategy
//!
//! Up to `max_attempts` tries per page:
//! - HTTP 429: wait `max(1, Retry-After)` seconds when the header parses,
//!   else `attempt × 1500 ms`, plus 0–500 ms of jitter.
//! - Any other HTTP or network failure: wait `attempt × 750 ms`.
//!
//! The last failure is returned once attempts run out.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::DatasetConfig;

/// Longest `Retry-After` honored on a 429.
const MAX_RETRY_AFTER_SECS: u64 = 300;

/// One page of the `/rows` response.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RowsPage {
    #[serde(default)]
    pub rows: Vec<RowEnvelope>,
    #[serde(default)]
    pub num_rows_total: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RowEnvelope {
    #[serde(default)]
    pub row_idx: Option<u64>,
    pub row: serde_json::Value,
}

/// Source of dataset pages.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn fetch_page(&self, offset: u64, length: usize) -> Result<RowsPage>;
}

/// Outcome of one failed page request, used to pick the backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    RateLimited { retry_after: Option<u64> },
    Other,
}

/// Delay before retrying after `attempt` (1-based) failed.
pub fn backoff_delay(attempt: u32, failure: &FetchFailure, jitter_ms: u64) -> Duration {
    match failure {
        FetchFailure::RateLimited {
            retry_after: Some(secs),
        } => {
            Duration::from_secs((*secs).clamp(1, MAX_RETRY_AFTER_SECS))
                + Duration::from_millis(jitter_ms)
        }
        FetchFailure::RateLimited { retry_after: None } => {
            Duration::from_millis(u64::from(attempt) * 1500 + jitter_ms)
        }
        FetchFailure::Other => Duration::from_millis(u64::from(attempt) * 750),
    }
}

/// [`RowSource`] over HTTP.
pub struct HttpRowSource {
    client: reqwest::Client,
    base_url: String,
    dataset: String,
    config: String,
    split: String,
    max_attempts: u32,
}

impl HttpRowSource {
    pub fn new(config: &DatasetConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            dataset: config.dataset.clone(),
            config: config.config.clone(),
            split: config.split.clone(),
            max_attempts: config.max_attempts.max(1),
        })
    }

    async fn fetch_once(
        &self,
        offset: u64,
        length: usize,
    ) -> std::result::Result<RowsPage, (FetchFailure, anyhow::Error)> {
        let response = self
            .client
            .get(format!("{}/rows", self.base_url))
            .header("Accept", "application/json")
            .query(&[
                ("dataset", self.dataset.as_str()),
                ("config", self.config.as_str()),
                ("split", self.split.as_str()),
            ])
            .query(&[("offset", offset), ("length", length as u64)])
            .send()
            .await
            .map_err(|e| (FetchFailure::Other, anyhow::Error::from(e)))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<RowsPage>()
                .await
                .map_err(|e| (FetchFailure::Other, anyhow!("invalid /rows response: {e}")));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            return Err((
                FetchFailure::RateLimited { retry_after },
                anyhow!("dataset rate limited (429) at offset={offset}"),
            ));
        }

        Err((
            FetchFailure::Other,
            anyhow!("dataset /rows failed: {status} at offset={offset}"),
        ))
    }
}

#[async_trait]
impl RowSource for HttpRowSource {
    async fn fetch_page(&self, offset: u64, length: usize) -> Result<RowsPage> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch_once(offset, length).await {
                Ok(page) => {
                    debug!(offset, rows = page.rows.len(), "fetched dataset page");
                    return Ok(page);
                }
                Err((failure, err)) => {
                    if attempt >= self.max_attempts {
                        return Err(err).with_context(|| {
                            format!("giving up on offset {offset} after {attempt} attempts")
                        });
                    }
                    let jitter = match failure {
                        FetchFailure::RateLimited { .. } => rand::thread_rng().gen_range(0..500),
                        FetchFailure::Other => 0,
                    };
                    let delay = backoff_delay(attempt, &failure, jitter);
                    warn!(
                        offset,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "dataset request failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
