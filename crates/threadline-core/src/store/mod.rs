//! Storage abstraction for Threadline.
//!
//! The [`Store`] trait covers every persistent operation used by the
//! pipeline stages and the retriever, so backends are interchangeable:
//! the app crate ships a SQLite store, and [`memory::InMemoryStore`] backs
//! tests.
//!
//! Every write is keyed by a content hash from [`crate::keys`], which makes
//! writes idempotent and lets concurrent runs of the same stage interleave
//! safely. The one read-modify-write operation,
//! [`increment_rate_bucket`](Store::increment_rate_bucket), must be atomic.

pub mod memory;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::models::{
    Chunk, ChunkFilter, ChunkHit, ChunkedMark, EmbeddingUpdate, Message, PendingChunk,
    StoreStats, Thread,
};

/// A nearest-neighbor query against stored chunk vectors.
#[derive(Debug, Clone)]
pub struct VectorQuery<'a> {
    pub vector: &'a [f32],
    /// Size of the candidate pool kept before truncating to `limit`.
    pub num_candidates: usize,
    pub limit: usize,
    pub filter: &'a ChunkFilter,
}

/// Abstract storage backend.
///
/// | Method | Stage |
/// |--------|-------|
/// | [`upsert_threads`](Store::upsert_threads), [`upsert_messages`](Store::upsert_messages) | Ingester |
/// | [`pending_messages`](Store::pending_messages), [`upsert_chunks`](Store::upsert_chunks), [`prune_superseded_chunks`](Store::prune_superseded_chunks), [`mark_messages_chunked`](Store::mark_messages_chunked), [`reset_chunked`](Store::reset_chunked) | Chunker |
/// | [`pending_chunks`](Store::pending_chunks), [`update_embeddings`](Store::update_embeddings), [`clear_embeddings`](Store::clear_embeddings), [`embedding_dims`](Store::embedding_dims) | Embedding backfill |
/// | [`vector_search`](Store::vector_search) | Retriever |
/// | [`increment_rate_bucket`](Store::increment_rate_bucket), [`purge_expired_rate_buckets`](Store::purge_expired_rate_buckets) | Rate limiter |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or update threads keyed by `thread_key`. Returns rows written.
    async fn upsert_threads(&self, threads: &[Thread]) -> Result<u64>;

    /// Insert or update messages keyed by `message_key`.
    ///
    /// Must leave `chunked_at` and `chunk_count` untouched on conflict.
    async fn upsert_messages(&self, messages: &[Message]) -> Result<u64>;

    async fn get_thread(&self, thread_key: &str) -> Result<Option<Thread>>;

    /// Messages of a thread in `order_index` order.
    async fn thread_messages(&self, thread_key: &str) -> Result<Vec<Message>>;

    /// Messages with no `chunked_at` and a non-empty body, in store order.
    async fn pending_messages(&self, limit: usize) -> Result<Vec<Message>>;

    /// Clear `chunked_at`/`chunk_count` on matching messages so the chunker
    /// processes them again.
    async fn reset_chunked(&self, filter: &ChunkFilter) -> Result<u64>;

    /// Insert or update chunks keyed by `chunk_key`.
    ///
    /// Must leave the embedding fields untouched on conflict.
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<u64>;

    /// Delete chunks of `message_key` whose key is not in `keep`.
    async fn prune_superseded_chunks(&self, message_key: &str, keep: &[String]) -> Result<u64>;

    async fn mark_messages_chunked(&self, marks: &[ChunkedMark], at: DateTime<Utc>)
        -> Result<u64>;

    /// Chunks in `chunk_index` order within each message, store order across
    /// messages.
    async fn list_chunks(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>>;

    /// Chunks with no embedding and non-empty text, in store order.
    async fn pending_chunks(&self, limit: usize, filter: &ChunkFilter)
        -> Result<Vec<PendingChunk>>;

    /// Apply vectors to existing chunks. Never inserts; returns the number
    /// of chunks that matched.
    async fn update_embeddings(&self, updates: &[EmbeddingUpdate]) -> Result<u64>;

    /// Remove vectors from matching chunks, making them pending again.
    async fn clear_embeddings(&self, filter: &ChunkFilter) -> Result<u64>;

    /// Distinct dimensionalities of stored vectors, ascending.
    async fn embedding_dims(&self) -> Result<Vec<usize>>;

    /// Rank embedded chunks matching the filter by cosine similarity.
    ///
    /// Fails with [`Error::DimensionMismatch`] when a stored vector's length
    /// differs from the query's.
    async fn vector_search(&self, query: &VectorQuery<'_>) -> Result<Vec<ChunkHit>>;

    /// Atomically count one request against the bucket `bucket_key`.
    ///
    /// If no bucket with `expires_at > now` exists, a fresh one starts with
    /// `expires_at = now + window`. Returns the post-increment count.
    async fn increment_rate_bucket(
        &self,
        bucket_key: &str,
        bucket: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<u32>;

    /// Delete buckets whose window has ended.
    async fn purge_expired_rate_buckets(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn stats(&self) -> Result<StoreStats>;
}

/// Order scored hits by descending score, keep `num_candidates`, then
/// truncate to `limit`.
///
/// The sort is stable, so equal scores keep the backend's scan order.
/// NaN scores rank last.
pub fn rank_hits(mut hits: Vec<ChunkHit>, num_candidates: usize, limit: usize) -> Vec<ChunkHit> {
    let key = |score: f64| if score.is_nan() { f64::NEG_INFINITY } else { score };
    hits.sort_by(|a, b| key(b.score).total_cmp(&key(a.score)));
    hits.truncate(num_candidates);
    hits.truncate(limit);
    hits
}

/// Fail when a stored vector cannot be compared with the query.
pub fn ensure_same_dims(stored: usize, query: usize) -> Result<()> {
    if stored != query {
        return Err(Error::DimensionMismatch {
            expected: vec![stored],
            actual: query,
        }
        .into());
    }
    Ok(())
}

pub(crate) fn window_end(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn hit(key: &str, score: f64) -> ChunkHit {
        ChunkHit {
            chunk_key: key.into(),
            thread_key: "t".into(),
            message_key: "m".into(),
            chunk_index: 0,
            text: String::new(),
            metadata: ChunkMetadata::default(),
            score,
        }
    }

    fn keys(hits: &[ChunkHit]) -> Vec<&str> {
        hits.iter().map(|h| h.chunk_key.as_str()).collect()
    }

    #[test]
    fn test_rank_hits_orders_ties_and_nan() {
        let hits = vec![
            hit("a", 0.2),
            hit("nan", f64::NAN),
            hit("b", 0.9),
            hit("c", 0.2),
            hit("d", -0.5),
        ];
        let ranked = rank_hits(hits.clone(), 10, 10);
        assert_eq!(keys(&ranked), vec!["b", "a", "c", "d", "nan"]);

        let ranked = rank_hits(hits, 3, 2);
        assert_eq!(keys(&ranked), vec!["b", "a"]);
    }
}
