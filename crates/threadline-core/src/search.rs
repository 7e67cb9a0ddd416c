//! Vector retrieval over embedded chunks.
//!
//! [`RetrieveParams::resolve`] validates the caller-facing knobs (`topK`,
//! `numCandidates`, filter) and [`retrieve`] runs the search once a query
//! vector is available. Embedding the query text is the caller's job, so
//! this module stays free of network code.

use anyhow::Result;

use crate::error::Error;
use crate::models::{ChunkFilter, ChunkHit};
use crate::store::{Store, VectorQuery};

pub const DEFAULT_TOP_K: usize = 8;
pub const MAX_TOP_K: usize = 20;
pub const MIN_NUM_CANDIDATES: usize = 10;
pub const MAX_NUM_CANDIDATES: usize = 2000;
/// Upper bound on query and chat message length, in chars.
pub const MAX_QUERY_CHARS: usize = 8000;

/// How the candidate pool is sized when the caller gives none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidatePolicy {
    /// `min(200, topK × 20)`
    Retrieval,
    /// `min(400, topK × 50)`
    Chat,
}

impl CandidatePolicy {
    pub fn default_candidates(self, top_k: usize) -> usize {
        let n = match self {
            CandidatePolicy::Retrieval => (top_k * 20).min(200),
            CandidatePolicy::Chat => (top_k * 50).min(400),
        };
        n.clamp(MIN_NUM_CANDIDATES, MAX_NUM_CANDIDATES)
    }
}

/// Configurable `topK` bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalLimits {
    pub default_top_k: usize,
    pub max_top_k: usize,
}

impl Default for RetrievalLimits {
    fn default() -> Self {
        Self {
            default_top_k: DEFAULT_TOP_K,
            max_top_k: MAX_TOP_K,
        }
    }
}

/// Validated retrieval parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrieveParams {
    pub top_k: usize,
    pub num_candidates: usize,
    pub filter: ChunkFilter,
}

impl RetrieveParams {
    pub fn resolve(
        top_k: Option<i64>,
        num_candidates: Option<i64>,
        filter: Option<ChunkFilter>,
        policy: CandidatePolicy,
        limits: RetrievalLimits,
    ) -> Result<Self> {
        let top_k = match top_k {
            None => limits.default_top_k,
            Some(k) if k >= 1 && k as u64 <= limits.max_top_k as u64 => k as usize,
            Some(k) => {
                return Err(Error::InvalidRequest(format!(
                    "topK must be between 1 and {}, got {k}",
                    limits.max_top_k
                ))
                .into())
            }
        };

        let num_candidates = match num_candidates {
            None => policy.default_candidates(top_k).max(top_k),
            Some(n)
                if n >= MIN_NUM_CANDIDATES as i64 && n <= MAX_NUM_CANDIDATES as i64 =>
            {
                n as usize
            }
            Some(n) => {
                return Err(Error::InvalidRequest(format!(
                    "numCandidates must be between {MIN_NUM_CANDIDATES} and {MAX_NUM_CANDIDATES}, got {n}"
                ))
                .into())
            }
        };
        if num_candidates < top_k {
            return Err(Error::InvalidRequest(format!(
                "numCandidates ({num_candidates}) must be >= topK ({top_k})"
            ))
            .into());
        }

        Ok(Self {
            top_k,
            num_candidates,
            filter: filter.unwrap_or_default(),
        })
    }
}

/// Trim a query or chat message and check its length.
pub fn validate_query(text: &str) -> Result<&str> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidRequest("query must not be empty".into()).into());
    }
    let len = trimmed.chars().count();
    if len > MAX_QUERY_CHARS {
        return Err(Error::InvalidRequest(format!(
            "query is {len} chars, limit is {MAX_QUERY_CHARS}"
        ))
        .into());
    }
    Ok(trimmed)
}

/// Run a vector search for an already-embedded query.
///
/// A corpus holding any dimensionality other than the query's is reported
/// as [`Error::DimensionMismatch`] instead of an empty result.
pub async fn retrieve(
    store: &dyn Store,
    query_vector: &[f32],
    params: &RetrieveParams,
) -> Result<Vec<ChunkHit>> {
    if query_vector.is_empty() {
        return Err(Error::InvalidRequest("query embedding is empty".into()).into());
    }

    let dims = store.embedding_dims().await?;
    if dims.iter().any(|&d| d != query_vector.len()) {
        return Err(Error::DimensionMismatch {
            expected: dims,
            actual: query_vector.len(),
        }
        .into());
    }

    store
        .vector_search(&VectorQuery {
            vector: query_vector,
            num_candidates: params.num_candidates,
            limit: params.top_k,
            filter: &params.filter,
        })
        .await
}
