//! In-memory [`Store`] implementation for tests.
//!
//! All state sits behind one `std::sync::Mutex`, which makes every
//! operation (rate-bucket increments included) atomic. Records keep their
//! insertion order so "store order" matches a SQLite rowid scan.
//! Vector search is brute-force cosine similarity.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    Chunk, ChunkFilter, ChunkHit, ChunkedMark, EmbeddingUpdate, Message, PendingChunk,
    StoreStats, Thread,
};
use crate::vector::cosine_similarity;

use super::{ensure_same_dims, rank_hits, window_end, Store, VectorQuery};

struct RateBucket {
    count: u32,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    threads: Vec<Thread>,
    messages: Vec<Message>,
    chunks: Vec<Chunk>,
    buckets: HashMap<String, RateBucket>,
}

impl State {
    fn thread_pos(&self, key: &str) -> Option<usize> {
        self.threads.iter().position(|t| t.thread_key == key)
    }

    fn message_pos(&self, key: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.message_key == key)
    }

    fn chunk_pos(&self, key: &str) -> Option<usize> {
        self.chunks.iter().position(|c| c.chunk_key == key)
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_threads(&self, threads: &[Thread]) -> Result<u64> {
        let mut state = self.lock()?;
        for thread in threads {
            match state.thread_pos(&thread.thread_key) {
                Some(i) => state.threads[i] = thread.clone(),
                None => state.threads.push(thread.clone()),
            }
        }
        Ok(threads.len() as u64)
    }

    async fn upsert_messages(&self, messages: &[Message]) -> Result<u64> {
        let mut state = self.lock()?;
        for msg in messages {
            match state.message_pos(&msg.message_key) {
                Some(i) => {
                    let existing = &mut state.messages[i];
                    let chunked_at = existing.chunked_at;
                    let chunk_count = existing.chunk_count;
                    *existing = msg.clone();
                    existing.chunked_at = chunked_at;
                    existing.chunk_count = chunk_count;
                }
                None => {
                    let mut fresh = msg.clone();
                    fresh.chunked_at = None;
                    fresh.chunk_count = None;
                    state.messages.push(fresh);
                }
            }
        }
        Ok(messages.len() as u64)
    }

    async fn get_thread(&self, thread_key: &str) -> Result<Option<Thread>> {
        let state = self.lock()?;
        Ok(state
            .thread_pos(thread_key)
            .map(|i| state.threads[i].clone()))
    }

    async fn thread_messages(&self, thread_key: &str) -> Result<Vec<Message>> {
        let state = self.lock()?;
        let mut out: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.thread_key == thread_key)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.order_index);
        Ok(out)
    }

    async fn pending_messages(&self, limit: usize) -> Result<Vec<Message>> {
        let state = self.lock()?;
        Ok(state
            .messages
            .iter()
            .filter(|m| m.chunked_at.is_none() && !m.body.is_empty())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn reset_chunked(&self, filter: &ChunkFilter) -> Result<u64> {
        let mut state = self.lock()?;
        let mut n = 0;
        for msg in state.messages.iter_mut() {
            if filter.matches(&msg.thread_key, &msg.message_key) && msg.chunked_at.is_some() {
                msg.chunked_at = None;
                msg.chunk_count = None;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<u64> {
        let mut state = self.lock()?;
        for chunk in chunks {
            match state.chunk_pos(&chunk.chunk_key) {
                Some(i) => {
                    let existing = &mut state.chunks[i];
                    existing.thread_key = chunk.thread_key.clone();
                    existing.message_key = chunk.message_key.clone();
                    existing.chunk_index = chunk.chunk_index;
                    existing.text = chunk.text.clone();
                    existing.metadata = chunk.metadata.clone();
                    existing.updated_at = chunk.updated_at;
                }
                None => {
                    let mut fresh = chunk.clone();
                    fresh.embedding = None;
                    fresh.embedding_model = None;
                    fresh.embedding_dims = None;
                    fresh.embedded_at = None;
                    state.chunks.push(fresh);
                }
            }
        }
        Ok(chunks.len() as u64)
    }

    async fn prune_superseded_chunks(&self, message_key: &str, keep: &[String]) -> Result<u64> {
        let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
        let mut state = self.lock()?;
        let before = state.chunks.len();
        state
            .chunks
            .retain(|c| c.message_key != message_key || keep.contains(c.chunk_key.as_str()));
        Ok((before - state.chunks.len()) as u64)
    }

    async fn mark_messages_chunked(
        &self,
        marks: &[ChunkedMark],
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.lock()?;
        let mut n = 0;
        for mark in marks {
            if let Some(i) = state.message_pos(&mark.message_key) {
                state.messages[i].chunked_at = Some(at);
                state.messages[i].chunk_count = Some(mark.chunk_count);
                n += 1;
            }
        }
        Ok(n)
    }

    async fn list_chunks(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>> {
        let state = self.lock()?;
        let mut out: Vec<Chunk> = state
            .chunks
            .iter()
            .filter(|c| filter.matches(&c.thread_key, &c.message_key))
            .cloned()
            .collect();
        // Group by message in first-seen order, chunk_index within.
        let mut first_seen: HashMap<String, usize> = HashMap::new();
        for (i, c) in out.iter().enumerate() {
            first_seen.entry(c.message_key.clone()).or_insert(i);
        }
        out.sort_by_key(|c| (first_seen[&c.message_key], c.chunk_index));
        Ok(out)
    }

    async fn pending_chunks(
        &self,
        limit: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<PendingChunk>> {
        let state = self.lock()?;
        Ok(state
            .chunks
            .iter()
            .filter(|c| {
                c.embedding.is_none()
                    && !c.text.is_empty()
                    && filter.matches(&c.thread_key, &c.message_key)
            })
            .take(limit)
            .map(|c| PendingChunk {
                chunk_key: c.chunk_key.clone(),
                text: c.text.clone(),
            })
            .collect())
    }

    async fn update_embeddings(&self, updates: &[EmbeddingUpdate]) -> Result<u64> {
        let mut state = self.lock()?;
        let mut n = 0;
        for update in updates {
            if let Some(i) = state.chunk_pos(&update.chunk_key) {
                let chunk = &mut state.chunks[i];
                chunk.embedding_dims = Some(update.embedding.len());
                chunk.embedding = Some(update.embedding.clone());
                chunk.embedding_model = Some(update.model.clone());
                chunk.embedded_at = Some(update.embedded_at);
                n += 1;
            }
        }
        Ok(n)
    }

    async fn clear_embeddings(&self, filter: &ChunkFilter) -> Result<u64> {
        let mut state = self.lock()?;
        let mut n = 0;
        for chunk in state.chunks.iter_mut() {
            if chunk.embedding.is_some() && filter.matches(&chunk.thread_key, &chunk.message_key) {
                chunk.embedding = None;
                chunk.embedding_model = None;
                chunk.embedding_dims = None;
                chunk.embedded_at = None;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn embedding_dims(&self) -> Result<Vec<usize>> {
        let state = self.lock()?;
        let dims: BTreeSet<usize> = state
            .chunks
            .iter()
            .filter_map(|c| c.embedding.as_ref().map(Vec::len))
            .collect();
        Ok(dims.into_iter().collect())
    }

    async fn vector_search(&self, query: &VectorQuery<'_>) -> Result<Vec<ChunkHit>> {
        let state = self.lock()?;
        let mut hits = Vec::new();
        for chunk in &state.chunks {
            let Some(vector) = chunk.embedding.as_ref() else {
                continue;
            };
            if !query.filter.matches(&chunk.thread_key, &chunk.message_key) {
                continue;
            }
            ensure_same_dims(vector.len(), query.vector.len())?;
            hits.push(ChunkHit {
                chunk_key: chunk.chunk_key.clone(),
                thread_key: chunk.thread_key.clone(),
                message_key: chunk.message_key.clone(),
                chunk_index: chunk.chunk_index,
                text: chunk.text.clone(),
                metadata: chunk.metadata.clone(),
                score: cosine_similarity(query.vector, vector),
            });
        }
        Ok(rank_hits(hits, query.num_candidates, query.limit))
    }

    async fn increment_rate_bucket(
        &self,
        bucket_key: &str,
        _bucket: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let mut state = self.lock()?;
        let entry = state
            .buckets
            .entry(bucket_key.to_string())
            .or_insert(RateBucket {
                count: 0,
                expires_at: now,
            });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = window_end(now, window);
        }
        entry.count = entry.count.saturating_add(1);
        Ok(entry.count)
    }

    async fn purge_expired_rate_buckets(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock()?;
        let before = state.buckets.len();
        state.buckets.retain(|_, b| b.expires_at > now);
        Ok((before - state.buckets.len()) as u64)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let state = self.lock()?;
        let dims: BTreeSet<usize> = state
            .chunks
            .iter()
            .filter_map(|c| c.embedding.as_ref().map(Vec::len))
            .collect();
        let embedded = state.chunks.iter().filter(|c| c.embedding.is_some()).count() as u64;
        Ok(StoreStats {
            threads: state.threads.len() as u64,
            messages: state.messages.len() as u64,
            messages_pending: state
                .messages
                .iter()
                .filter(|m| m.chunked_at.is_none() && !m.body.is_empty())
                .count() as u64,
            chunks: state.chunks.len() as u64,
            chunks_embedded: embedded,
            chunks_pending: state
                .chunks
                .iter()
                .filter(|c| c.embedding.is_none() && !c.text.is_empty())
                .count() as u64,
            embedding_dims: dims.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::ChunkMetadata;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn message(thread: &str, key: &str, order: i64, body: &str) -> Message {
        Message {
            thread_key: thread.into(),
            message_key: key.into(),
            order_index: order,
            sender: Some("a@example.com".into()),
            recipients: vec![],
            timestamp: None,
            timestamp_raw: None,
            subject: None,
            body: body.into(),
            raw: None,
            updated_at: ts(0),
            chunked_at: None,
            chunk_count: None,
        }
    }

    fn chunk(thread: &str, msg: &str, key: &str, index: i64) -> Chunk {
        Chunk {
            chunk_key: key.into(),
            thread_key: thread.into(),
            message_key: msg.into(),
            chunk_index: index,
            text: format!("text of {key}"),
            metadata: ChunkMetadata::default(),
            embedding: None,
            embedding_model: None,
            embedding_dims: None,
            embedded_at: None,
            updated_at: ts(0),
        }
    }

    fn update(key: &str, v: Vec<f32>) -> EmbeddingUpdate {
        EmbeddingUpdate {
            chunk_key: key.into(),
            embedding: v,
            model: "test-model".into(),
            embedded_at: ts(10),
        }
    }

    #[tokio::test]
    async fn test_message_upsert_preserves_chunk_state() {
        let store = InMemoryStore::new();
        store
            .upsert_messages(&[message("t", "m1", 0, "hello")])
            .await
            .unwrap();
        store
            .mark_messages_chunked(
                &[ChunkedMark {
                    message_key: "m1".into(),
                    chunk_count: 1,
                }],
                ts(5),
            )
            .await
            .unwrap();

        store
            .upsert_messages(&[message("t", "m1", 0, "hello")])
            .await
            .unwrap();

        let msgs = store.thread_messages("t").await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].chunked_at, Some(ts(5)));
        assert_eq!(msgs[0].chunk_count, Some(1));
        assert!(store.pending_messages(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_messages_skip_empty_bodies() {
        let store = InMemoryStore::new();
        store
            .upsert_messages(&[message("t", "m1", 0, ""), message("t", "m2", 1, "body")])
            .await
            .unwrap();
        let pending = store.pending_messages(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_key, "m2");
    }

    #[tokio::test]
    async fn test_chunk_upsert_keeps_embedding() {
        let store = InMemoryStore::new();
        store.upsert_chunks(&[chunk("t", "m", "c1", 0)]).await.unwrap();
        store
            .update_embeddings(&[update("c1", vec![1.0, 0.0])])
            .await
            .unwrap();
        store.upsert_chunks(&[chunk("t", "m", "c1", 0)]).await.unwrap();

        let chunks = store.list_chunks(&ChunkFilter::default()).await.unwrap();
        assert_eq!(chunks[0].embedding, Some(vec![1.0, 0.0]));
        assert_eq!(chunks[0].embedding_dims, Some(2));
    }

    #[tokio::test]
    async fn test_update_embeddings_never_inserts() {
        let store = InMemoryStore::new();
        let n = store
            .update_embeddings(&[update("missing", vec![1.0])])
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(store.stats().await.unwrap().chunks, 0);
    }

    #[tokio::test]
    async fn test_prune_superseded_chunks() {
        let store = InMemoryStore::new();
        store
            .upsert_chunks(&[
                chunk("t", "m", "old", 0),
                chunk("t", "m", "new", 0),
                chunk("t", "other", "x", 0),
            ])
            .await
            .unwrap();
        let removed = store
            .prune_superseded_chunks("m", &["new".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let keys: Vec<String> = store
            .list_chunks(&ChunkFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.chunk_key)
            .collect();
        assert_eq!(keys, vec!["new", "x"]);
    }

    #[tokio::test]
    async fn test_vector_search_ranks_and_filters() {
        let store = InMemoryStore::new();
        store
            .upsert_chunks(&[
                chunk("t1", "m1", "a", 0),
                chunk("t1", "m1", "b", 1),
                chunk("t2", "m2", "c", 0),
            ])
            .await
            .unwrap();
        store
            .update_embeddings(&[
                update("a", vec![1.0, 0.0]),
                update("b", vec![0.6, 0.8]),
                update("c", vec![1.0, 0.1]),
            ])
            .await
            .unwrap();

        let all = ChunkFilter::default();
        let hits = store
            .vector_search(&VectorQuery {
                vector: &[1.0, 0.0],
                num_candidates: 10,
                limit: 2,
                filter: &all,
            })
            .await
            .unwrap();
        let keys: Vec<&str> = hits.iter().map(|h| h.chunk_key.as_str()).collect();
        assert_eq!(keys, vec!["a", "c"]);
        assert!((hits[0].score - 1.0).abs() < 1e-9);

        let t1 = ChunkFilter::thread("t1");
        let hits = store
            .vector_search(&VectorQuery {
                vector: &[0.0, 1.0],
                num_candidates: 10,
                limit: 5,
                filter: &t1,
            })
            .await
            .unwrap();
        let keys: Vec<&str> = hits.iter().map(|h| h.chunk_key.as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_vector_search_dimension_mismatch() {
        let store = InMemoryStore::new();
        store.upsert_chunks(&[chunk("t", "m", "a", 0)]).await.unwrap();
        store
            .update_embeddings(&[update("a", vec![1.0, 0.0, 0.0])])
            .await
            .unwrap();

        let all = ChunkFilter::default();
        let err = store
            .vector_search(&VectorQuery {
                vector: &[1.0, 0.0],
                num_candidates: 10,
                limit: 1,
                filter: &all,
            })
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<Error>(),
            Some(&Error::DimensionMismatch {
                expected: vec![3],
                actual: 2
            })
        );
    }

    #[tokio::test]
    async fn test_rate_bucket_window() {
        let store = InMemoryStore::new();
        let window = Duration::from_secs(60);
        for expected in 1..=3 {
            let n = store
                .increment_rate_bucket("k", "retrieve", window, ts(100))
                .await
                .unwrap();
            assert_eq!(n, expected);
        }
        // Window ends at 160; a request at exactly 160 starts a new one.
        let n = store
            .increment_rate_bucket("k", "retrieve", window, ts(160))
            .await
            .unwrap();
        assert_eq!(n, 1);

        assert_eq!(store.purge_expired_rate_buckets(ts(219)).await.unwrap(), 0);
        assert_eq!(store.purge_expired_rate_buckets(ts(220)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clear_embeddings_makes_chunks_pending() {
        let store = InMemoryStore::new();
        store
            .upsert_chunks(&[chunk("t1", "m1", "a", 0), chunk("t2", "m2", "b", 0)])
            .await
            .unwrap();
        store
            .update_embeddings(&[update("a", vec![1.0]), update("b", vec![1.0])])
            .await
            .unwrap();
        assert_eq!(
            store
                .clear_embeddings(&ChunkFilter::thread("t1"))
                .await
                .unwrap(),
            1
        );
        let pending = store
            .pending_chunks(10, &ChunkFilter::default())
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].chunk_key, "a");

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.chunks_embedded, 1);
        assert_eq!(stats.embedding_dims, vec![1]);
    }
}
