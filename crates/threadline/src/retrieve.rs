//! Retrieval and chat service shared by the HTTP server and the CLI.
//!
//! Every request is counted against its rate-limit bucket first, before any
//! validation or paid provider call, so rejected callers cost nothing.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use threadline_core::models::{ChunkFilter, ChunkHit};
use threadline_core::rate_limit::{RateDecision, RateLimitRule, RateLimiter};
use threadline_core::search::{
    self, validate_query, CandidatePolicy, RetrievalLimits, RetrieveParams,
};
use threadline_core::store::Store;
use threadline_core::Error;

use crate::embedding::{embed_query, EmbeddingProvider, RetryPolicy};
use crate::generation::TextGenerator;

/// Chars of chunk text kept in a citation snippet.
const SNIPPET_CHARS: usize = 240;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetrieveRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<i64>,
    #[serde(default)]
    pub num_candidates: Option<i64>,
    #[serde(default)]
    pub filter: Option<ChunkFilter>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveMeta {
    pub top_k: usize,
    pub num_candidates: usize,
    pub embed_model: String,
    pub filter: ChunkFilter,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrieveResponse {
    pub hits: Vec<ChunkHit>,
    pub remaining: u32,
    pub meta: RetrieveMeta,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub top_k: Option<i64>,
    #[serde(default)]
    pub filter: Option<ChunkFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    /// 1-based source number as used in the prompt.
    pub index: usize,
    pub chunk_key: String,
    pub thread_key: String,
    pub message_key: String,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub snippet: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub text: String,
    pub citations: Vec<Citation>,
    pub remaining: u32,
}

pub struct RetrievalService {
    pub store: Arc<dyn Store>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub generator: Arc<dyn TextGenerator>,
    pub limiter: RateLimiter,
    pub retrieve_rule: RateLimitRule,
    pub chat_rule: RateLimitRule,
    pub limits: RetrievalLimits,
    pub retry: RetryPolicy,
}

impl RetrievalService {
    async fn admit(&self, client_id: &str, rule: &RateLimitRule) -> Result<RateDecision> {
        let decision = self.limiter.check(self.store.as_ref(), client_id, rule).await?;
        if !decision.allowed {
            return Err(Error::RateLimited {
                bucket: rule.bucket.clone(),
            }
            .into());
        }
        Ok(decision)
    }

    async fn search(&self, query: &str, params: &RetrieveParams) -> Result<Vec<ChunkHit>> {
        let vector = embed_query(self.embedder.as_ref(), query, &self.retry).await?;
        let hits = search::retrieve(self.store.as_ref(), &vector, params).await?;
        debug!(
            hits = hits.len(),
            top_k = params.top_k,
            num_candidates = params.num_candidates,
            "vector search"
        );
        Ok(hits)
    }

    pub async fn retrieve(&self, client_id: &str, req: RetrieveRequest) -> Result<RetrieveResponse> {
        let decision = self.admit(client_id, &self.retrieve_rule).await?;
        let query = validate_query(&req.query)?;
        let params = RetrieveParams::resolve(
            req.top_k,
            req.num_candidates,
            req.filter,
            CandidatePolicy::Retrieval,
            self.limits,
        )?;

        let hits = self.search(query, &params).await?;
        Ok(RetrieveResponse {
            hits,
            remaining: decision.remaining,
            meta: RetrieveMeta {
                top_k: params.top_k,
                num_candidates: params.num_candidates,
                embed_model: self.embedder.model_name().to_string(),
                filter: params.filter,
            },
        })
    }

    pub async fn chat(&self, client_id: &str, req: ChatRequest) -> Result<ChatResponse> {
        let decision = self.admit(client_id, &self.chat_rule).await?;
        let message = validate_query(&req.message)?;
        let params = RetrieveParams::resolve(
            req.top_k,
            None,
            req.filter,
            CandidatePolicy::Chat,
            self.limits,
        )?;

        let hits = self.search(message, &params).await?;
        let prompt = build_prompt(message, &hits);
        let text = self
            .generator
            .generate(&prompt)
            .await
            .map_err(anyhow::Error::new)?;

        Ok(ChatResponse {
            text,
            citations: citations(&hits),
            remaining: decision.remaining,
        })
    }
}

/// Prompt with the question and the hits as numbered sources.
pub fn build_prompt(question: &str, hits: &[ChunkHit]) -> String {
    let mut prompt = String::from(
        "Answer the question using only the numbered email excerpts below. \
         Cite the excerpts you rely on as [n]. If they do not contain the answer, say so.\n\n",
    );
    if hits.is_empty() {
        prompt.push_str("Sources: none\n\n");
    } else {
        prompt.push_str("Sources:\n");
        for (i, hit) in hits.iter().enumerate() {
            let meta = &hit.metadata;
            let date = meta
                .timestamp
                .map(|t| t.to_rfc3339())
                .or_else(|| meta.timestamp_raw.clone());
            prompt.push_str(&format!(
                "[{}] From: {} | Subject: {} | Date: {}\n{}\n\n",
                i + 1,
                meta.sender.as_deref().unwrap_or("unknown"),
                meta.subject.as_deref().unwrap_or("(none)"),
                date.as_deref().unwrap_or("unknown"),
                hit.text.trim()
            ));
        }
    }
    prompt.push_str("Question: ");
    prompt.push_str(question);
    prompt
}

pub fn citations(hits: &[ChunkHit]) -> Vec<Citation> {
    hits.iter()
        .enumerate()
        .map(|(i, hit)| Citation {
            index: i + 1,
            chunk_key: hit.chunk_key.clone(),
            thread_key: hit.thread_key.clone(),
            message_key: hit.message_key.clone(),
            subject: hit.metadata.subject.clone(),
            sender: hit.metadata.sender.clone(),
            snippet: hit.text.chars().take(SNIPPET_CHARS).collect(),
            score: hit.score,
        })
        .collect()
}
