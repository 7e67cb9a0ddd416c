//! Fixed-window request limiter backed by a [`Store`].
//!
//! Each `(bucket, client, window)` triple maps to one salted bucket key.
//! The store increments the bucket atomically, so two concurrent callers
//! racing for the last slot never both get through.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::keys::rate_limit_key;
use crate::store::Store;

/// Limit applied to one named bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    pub bucket: String,
    pub window_secs: u64,
    pub max_requests: u32,
}

impl RateLimitRule {
    pub fn new(bucket: impl Into<String>, window_secs: u64, max_requests: u32) -> Result<Self> {
        let bucket = bucket.into();
        if window_secs == 0 {
            return Err(Error::InvalidConfig(format!(
                "rate limit '{bucket}': window_secs must be > 0"
            ))
            .into());
        }
        if max_requests == 0 {
            return Err(Error::InvalidConfig(format!(
                "rate limit '{bucket}': max_requests must be > 0"
            ))
            .into());
        }
        Ok(Self {
            bucket,
            window_secs,
            max_requests,
        })
    }
}

/// Outcome of one [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Post-increment request count in the current window.
    pub count: u32,
}

impl RateDecision {
    fn from_count(count: u32, max_requests: u32) -> Self {
        Self {
            allowed: count <= max_requests,
            remaining: max_requests.saturating_sub(count),
            count,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    salt: String,
}

impl RateLimiter {
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    /// Count one request from `client_id` against `rule`.
    pub async fn check(
        &self,
        store: &dyn Store,
        client_id: &str,
        rule: &RateLimitRule,
    ) -> Result<RateDecision> {
        self.check_at(store, client_id, rule, Utc::now()).await
    }

    pub async fn check_at(
        &self,
        store: &dyn Store,
        client_id: &str,
        rule: &RateLimitRule,
        now: DateTime<Utc>,
    ) -> Result<RateDecision> {
        let key = rate_limit_key(&self.salt, &rule.bucket, client_id, rule.window_secs);
        let count = store
            .increment_rate_bucket(
                &key,
                &rule.bucket,
                Duration::from_secs(rule.window_secs),
                now,
            )
            .await?;
        Ok(RateDecision::from_count(count, rule.max_requests))
    }
}
