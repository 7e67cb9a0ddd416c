//! SQLite-backed [`Store`] implementation.
//!
//! Each batch write runs in one transaction. Vectors are stored as
//! little-endian `f32` BLOBs on the chunk row and searched by exact cosine
//! similarity in Rust.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use threadline_core::models::{
    Chunk, ChunkFilter, ChunkHit, ChunkMetadata, ChunkedMark, EmbeddingUpdate, Message,
    PendingChunk, StoreStats, Thread,
};
use threadline_core::store::{ensure_same_dims, rank_hits, Store, VectorQuery};
use threadline_core::vector::{blob_to_vec, cosine_similarity, vec_to_blob};

use crate::{db, migrate};

/// SQLite implementation of the [`Store`] trait.
///
/// Construct with [`SqliteStore::open`] and release with
/// [`SqliteStore::close`]. There is no shared global connection.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `db_path` and bring the schema up to date.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let pool = db::connect(db_path).await?;
        migrate::run_migrations(&pool)
            .await
            .context("Failed to run migrations")?;
        Ok(Self { pool })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).with_context(|| format!("timestamp out of range: {ms}"))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn string_list(json: &str) -> Result<Vec<String>> {
    serde_json::from_str(json).context("Failed to decode stored string list")
}

fn row_to_thread(row: &SqliteRow) -> Result<Thread> {
    Ok(Thread {
        thread_key: row.try_get("thread_key")?,
        thread_id: row.try_get("thread_id")?,
        source_file: row.try_get("source_file")?,
        subject: row.try_get("subject")?,
        message_count: row.try_get("message_count")?,
        participants: string_list(&row.try_get::<String, _>("participants_json")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

fn row_to_message(row: &SqliteRow) -> Result<Message> {
    Ok(Message {
        thread_key: row.try_get("thread_key")?,
        message_key: row.try_get("message_key")?,
        order_index: row.try_get("order_index")?,
        sender: row.try_get("sender")?,
        recipients: string_list(&row.try_get::<String, _>("recipients_json")?)?,
        timestamp: opt_from_millis(row.try_get("timestamp")?)?,
        timestamp_raw: row.try_get("timestamp_raw")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        raw: row.try_get("raw_json")?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
        chunked_at: opt_from_millis(row.try_get("chunked_at")?)?,
        chunk_count: row.try_get("chunk_count")?,
    })
}

fn row_to_chunk(row: &SqliteRow) -> Result<Chunk> {
    let metadata: ChunkMetadata =
        serde_json::from_str(&row.try_get::<String, _>("metadata_json")?)
            .context("Failed to decode chunk metadata")?;
    let embedding: Option<Vec<u8>> = row.try_get("embedding")?;
    let dims: Option<i64> = row.try_get("embedding_dims")?;
    Ok(Chunk {
        chunk_key: row.try_get("chunk_key")?,
        thread_key: row.try_get("thread_key")?,
        message_key: row.try_get("message_key")?,
        chunk_index: row.try_get("chunk_index")?,
        text: row.try_get("text")?,
        metadata,
        embedding: embedding.as_deref().map(blob_to_vec),
        embedding_model: row.try_get("embedding_model")?,
        embedding_dims: dims.map(|d| d as usize),
        embedded_at: opt_from_millis(row.try_get("embedded_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

const MESSAGE_COLUMNS: &str = "message_key, thread_key, order_index, sender, recipients_json, \
     timestamp, timestamp_raw, subject, body, raw_json, updated_at, chunked_at, chunk_count";

const CHUNK_COLUMNS: &str = "chunk_key, thread_key, message_key, chunk_index, text, \
     metadata_json, embedding, embedding_model, embedding_dims, embedded_at, updated_at";

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_threads(&self, threads: &[Thread]) -> Result<u64> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;
        for thread in threads {
            sqlx::query(
                r#"
                INSERT INTO threads (thread_key, thread_id, source_file, subject,
                                     message_count, participants_json, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(thread_key) DO UPDATE SET
                    thread_id = excluded.thread_id,
                    source_file = excluded.source_file,
                    subject = excluded.subject,
                    message_count = excluded.message_count,
                    participants_json = excluded.participants_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&thread.thread_key)
            .bind(&thread.thread_id)
            .bind(&thread.source_file)
            .bind(&thread.subject)
            .bind(thread.message_count)
            .bind(serde_json::to_string(&thread.participants)?)
            .bind(now)
            .bind(to_millis(thread.updated_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(threads.len() as u64)
    }

    async fn upsert_messages(&self, messages: &[Message]) -> Result<u64> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;
        for msg in messages {
            sqlx::query(
                r#"
                INSERT INTO messages (message_key, thread_key, order_index, sender,
                                      recipients_json, timestamp, timestamp_raw, subject,
                                      body, raw_json, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(message_key) DO UPDATE SET
                    thread_key = excluded.thread_key,
                    order_index = excluded.order_index,
                    sender = excluded.sender,
                    recipients_json = excluded.recipients_json,
                    timestamp = excluded.timestamp,
                    timestamp_raw = excluded.timestamp_raw,
                    subject = excluded.subject,
                    body = excluded.body,
                    raw_json = excluded.raw_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&msg.message_key)
            .bind(&msg.thread_key)
            .bind(msg.order_index)
            .bind(&msg.sender)
            .bind(serde_json::to_string(&msg.recipients)?)
            .bind(msg.timestamp.map(to_millis))
            .bind(&msg.timestamp_raw)
            .bind(&msg.subject)
            .bind(&msg.body)
            .bind(&msg.raw)
            .bind(now)
            .bind(to_millis(msg.updated_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(messages.len() as u64)
    }

    async fn get_thread(&self, thread_key: &str) -> Result<Option<Thread>> {
        let row = sqlx::query(
            "SELECT thread_key, thread_id, source_file, subject, message_count, \
             participants_json, updated_at FROM threads WHERE thread_key = ?",
        )
        .bind(thread_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_thread).transpose()
    }

    async fn thread_messages(&self, thread_key: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_key = ? ORDER BY order_index"
        ))
        .bind(thread_key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    async fn pending_messages(&self, limit: usize) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE chunked_at IS NULL AND body != '' ORDER BY rowid LIMIT ?"
        ))
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    async fn reset_chunked(&self, filter: &ChunkFilter) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET chunked_at = NULL, chunk_count = NULL
            WHERE chunked_at IS NOT NULL
              AND (?1 IS NULL OR thread_key = ?1)
              AND (?2 IS NULL OR message_key = ?2)
            "#,
        )
        .bind(&filter.thread_key)
        .bind(&filter.message_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<u64> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (chunk_key, thread_key, message_key, chunk_index, text,
                                    metadata_json, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_key) DO UPDATE SET
                    thread_key = excluded.thread_key,
                    message_key = excluded.message_key,
                    chunk_index = excluded.chunk_index,
                    text = excluded.text,
                    metadata_json = excluded.metadata_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&chunk.chunk_key)
            .bind(&chunk.thread_key)
            .bind(&chunk.message_key)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(serde_json::to_string(&chunk.metadata)?)
            .bind(now)
            .bind(to_millis(chunk.updated_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(chunks.len() as u64)
    }

    async fn prune_superseded_chunks(&self, message_key: &str, keep: &[String]) -> Result<u64> {
        let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
        let mut tx = self.pool.begin().await?;
        let existing: Vec<String> =
            sqlx::query_scalar("SELECT chunk_key FROM chunks WHERE message_key = ?")
                .bind(message_key)
                .fetch_all(&mut *tx)
                .await?;

        let mut removed = 0;
        for key in existing.iter().filter(|k| !keep.contains(k.as_str())) {
            removed += sqlx::query("DELETE FROM chunks WHERE chunk_key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn mark_messages_chunked(
        &self,
        marks: &[ChunkedMark],
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let at = to_millis(at);
        let mut tx = self.pool.begin().await?;
        let mut n = 0;
        for mark in marks {
            n += sqlx::query(
                "UPDATE messages SET chunked_at = ?, chunk_count = ?, updated_at = ? \
                 WHERE message_key = ?",
            )
            .bind(at)
            .bind(mark.chunk_count)
            .bind(at)
            .bind(&mark.message_key)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(n)
    }

    async fn list_chunks(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks \
             WHERE (?1 IS NULL OR thread_key = ?1) AND (?2 IS NULL OR message_key = ?2) \
             ORDER BY (SELECT MIN(c2.rowid) FROM chunks c2 \
                       WHERE c2.message_key = chunks.message_key), chunk_index"
        ))
        .bind(&filter.thread_key)
        .bind(&filter.message_key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn pending_chunks(
        &self,
        limit: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<PendingChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT chunk_key, text FROM chunks
            WHERE embedding IS NULL AND text != ''
              AND (?1 IS NULL OR thread_key = ?1)
              AND (?2 IS NULL OR message_key = ?2)
            ORDER BY rowid
            LIMIT ?3
            "#,
        )
        .bind(&filter.thread_key)
        .bind(&filter.message_key)
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<PendingChunk> {
                Ok(PendingChunk {
                    chunk_key: row.try_get("chunk_key")?,
                    text: row.try_get("text")?,
                })
            })
            .collect()
    }

    async fn update_embeddings(&self, updates: &[EmbeddingUpdate]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut n = 0;
        for update in updates {
            let at = to_millis(update.embedded_at);
            n += sqlx::query(
                r#"
                UPDATE chunks SET
                    embedding = ?,
                    embedding_model = ?,
                    embedding_dims = ?,
                    embedded_at = ?,
                    updated_at = ?
                WHERE chunk_key = ?
                "#,
            )
            .bind(vec_to_blob(&update.embedding))
            .bind(&update.model)
            .bind(to_i64(update.embedding.len()))
            .bind(at)
            .bind(at)
            .bind(&update.chunk_key)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(n)
    }

    async fn clear_embeddings(&self, filter: &ChunkFilter) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE chunks SET
                embedding = NULL,
                embedding_model = NULL,
                embedding_dims = NULL,
                embedded_at = NULL
            WHERE embedding IS NOT NULL
              AND (?1 IS NULL OR thread_key = ?1)
              AND (?2 IS NULL OR message_key = ?2)
            "#,
        )
        .bind(&filter.thread_key)
        .bind(&filter.message_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn embedding_dims(&self) -> Result<Vec<usize>> {
        let dims: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT embedding_dims FROM chunks \
             WHERE embedding IS NOT NULL ORDER BY embedding_dims",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(dims.into_iter().map(|d| d as usize).collect())
    }

    async fn vector_search(&self, query: &VectorQuery<'_>) -> Result<Vec<ChunkHit>> {
        let rows = sqlx::query(
            r#"
            SELECT chunk_key, thread_key, message_key, chunk_index, text, metadata_json, embedding
            FROM chunks
            WHERE embedding IS NOT NULL
              AND (?1 IS NULL OR thread_key = ?1)
              AND (?2 IS NULL OR message_key = ?2)
            ORDER BY rowid
            "#,
        )
        .bind(&query.filter.thread_key)
        .bind(&query.filter.message_key)
        .fetch_all(&self.pool)
        .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.try_get("embedding")?;
            let vector = blob_to_vec(&blob);
            ensure_same_dims(vector.len(), query.vector.len())?;
            let metadata: ChunkMetadata =
                serde_json::from_str(&row.try_get::<String, _>("metadata_json")?)
                    .context("Failed to decode chunk metadata")?;
            hits.push(ChunkHit {
                chunk_key: row.try_get("chunk_key")?,
                thread_key: row.try_get("thread_key")?,
                message_key: row.try_get("message_key")?,
                chunk_index: row.try_get("chunk_index")?,
                text: row.try_get("text")?,
                metadata,
                score: cosine_similarity(query.vector, &vector),
            });
        }
        Ok(rank_hits(hits, query.num_candidates, query.limit))
    }

    async fn increment_rate_bucket(
        &self,
        bucket_key: &str,
        bucket: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let now_ms = to_millis(now);
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let expires_ms = now_ms.saturating_add(window_ms);

        // One statement: a live bucket is incremented, an expired one restarts.
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO rate_limits (bucket_key, bucket, count, created_at, expires_at)
            VALUES (?1, ?2, 1, ?3, ?4)
            ON CONFLICT(bucket_key) DO UPDATE SET
                count = CASE WHEN rate_limits.expires_at > excluded.created_at
                             THEN rate_limits.count + 1 ELSE 1 END,
                created_at = CASE WHEN rate_limits.expires_at > excluded.created_at
                                  THEN rate_limits.created_at ELSE excluded.created_at END,
                expires_at = CASE WHEN rate_limits.expires_at > excluded.created_at
                                  THEN rate_limits.expires_at ELSE excluded.expires_at END
            RETURNING count
            "#,
        )
        .bind(bucket_key)
        .bind(bucket)
        .bind(now_ms)
        .bind(expires_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn purge_expired_rate_buckets(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE expires_at <= ?")
            .bind(to_millis(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let threads: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM threads")
            .fetch_one(&self.pool)
            .await?;
        let messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        let messages_pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE chunked_at IS NULL AND body != ''",
        )
        .fetch_one(&self.pool)
        .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let chunks_embedded: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        let chunks_pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE embedding IS NULL AND text != ''",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            threads: threads as u64,
            messages: messages as u64,
            messages_pending: messages_pending as u64,
            chunks: chunks as u64,
            chunks_embedded: chunks_embedded as u64,
            chunks_pending: chunks_pending as u64,
            embedding_dims: self.embedding_dims().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use tempfile::TempDir;
    use threadline_core::Error;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    async fn open_temp() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(&dir.path().join("data/test.sqlite"))
            .await
            .unwrap();
        (dir, store)
    }

    fn message(key: &str, order: i64, body: &str) -> Message {
        Message {
            thread_key: "t".into(),
            message_key: key.into(),
            order_index: order,
            sender: Some("alice@example.com".into()),
            recipients: vec!["bob@example.com".into()],
            timestamp: Some(ts(1_000)),
            timestamp_raw: Some("1970-01-01T00:16:40Z".into()),
            subject: Some("Hello".into()),
            body: body.into(),
            raw: None,
            updated_at: ts(2_000),
            chunked_at: None,
            chunk_count: None,
        }
    }

    fn chunk(msg: &str, key: &str, index: i64) -> Chunk {
        Chunk {
            chunk_key: key.into(),
            thread_key: "t".into(),
            message_key: msg.into(),
            chunk_index: index,
            text: format!("text {key}"),
            metadata: ChunkMetadata {
                order_index: 0,
                sender: Some("alice@example.com".into()),
                ..Default::default()
            },
            embedding: None,
            embedding_model: None,
            embedding_dims: None,
            embedded_at: None,
            updated_at: ts(3_000),
        }
    }

    #[tokio::test]
    async fn test_message_round_trip_and_chunk_state() {
        let (_dir, store) = open_temp().await;
        store
            .upsert_messages(&[message("m1", 0, "one"), message("m2", 1, "")])
            .await
            .unwrap();
        let msgs = store.thread_messages("t").await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].recipients, vec!["bob@example.com".to_string()]);
        assert_eq!(msgs[0].timestamp, Some(ts(1_000)));

        let pending = store.pending_messages(10).await.unwrap();
        assert_eq!(pending.len(), 1);

        store
            .mark_messages_chunked(
                &[ChunkedMark {
                    message_key: "m1".into(),
                    chunk_count: 1,
                }],
                ts(5_000),
            )
            .await
            .unwrap();
        store
            .upsert_messages(&[message("m1", 0, "one")])
            .await
            .unwrap();
        assert!(store.pending_messages(10).await.unwrap().is_empty());

        assert_eq!(store.reset_chunked(&ChunkFilter::default()).await.unwrap(), 1);
        assert_eq!(store.pending_messages(10).await.unwrap().len(), 1);
        store.close().await;
    }

    #[tokio::test]
    async fn test_embeddings_survive_chunk_upsert() {
        let (_dir, store) = open_temp().await;
        store.upsert_chunks(&[chunk("m", "c1", 0)]).await.unwrap();
        let n = store
            .update_embeddings(&[
                EmbeddingUpdate {
                    chunk_key: "c1".into(),
                    embedding: vec![0.5, 0.5],
                    model: "test".into(),
                    embedded_at: ts(10),
                },
                EmbeddingUpdate {
                    chunk_key: "missing".into(),
                    embedding: vec![0.5, 0.5],
                    model: "test".into(),
                    embedded_at: ts(10),
                },
            ])
            .await
            .unwrap();
        assert_eq!(n, 1);

        store.upsert_chunks(&[chunk("m", "c1", 0)]).await.unwrap();
        let chunks = store.list_chunks(&ChunkFilter::default()).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].embedding, Some(vec![0.5, 0.5]));
        assert_eq!(chunks[0].embedding_dims, Some(2));
        assert_eq!(chunks[0].metadata.sender.as_deref(), Some("alice@example.com"));
        assert_eq!(store.embedding_dims().await.unwrap(), vec![2]);
        store.close().await;
    }

    #[tokio::test]
    async fn test_vector_search_and_mismatch() {
        let (_dir, store) = open_temp().await;
        store
            .upsert_chunks(&[chunk("m", "a", 0), chunk("m", "b", 1)])
            .await
            .unwrap();
        store
            .update_embeddings(&[
                EmbeddingUpdate {
                    chunk_key: "a".into(),
                    embedding: vec![1.0, 0.0],
                    model: "test".into(),
                    embedded_at: ts(10),
                },
                EmbeddingUpdate {
                    chunk_key: "b".into(),
                    embedding: vec![0.0, 1.0],
                    model: "test".into(),
                    embedded_at: ts(10),
                },
            ])
            .await
            .unwrap();

        let filter = ChunkFilter::default();
        let hits = store
            .vector_search(&VectorQuery {
                vector: &[0.1, 0.9],
                num_candidates: 10,
                limit: 1,
                filter: &filter,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_key, "b");

        let err = store
            .vector_search(&VectorQuery {
                vector: &[1.0, 0.0, 0.0],
                num_candidates: 10,
                limit: 1,
                filter: &filter,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::DimensionMismatch { .. })
        ));
        store.close().await;
    }

    #[tokio::test]
    async fn test_prune_superseded_chunks() {
        let (_dir, store) = open_temp().await;
        store
            .upsert_chunks(&[chunk("m", "old", 0), chunk("m", "new", 0), chunk("x", "y", 0)])
            .await
            .unwrap();
        let removed = store
            .prune_superseded_chunks("m", &["new".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.stats().await.unwrap().chunks, 2);
        store.close().await;
    }

    #[tokio::test]
    async fn test_rate_bucket_atomic_upsert() {
        let (_dir, store) = open_temp().await;
        let window = Duration::from_secs(60);
        let counts: Vec<u32> = {
            let mut v = Vec::new();
            for _ in 0..3 {
                v.push(
                    store
                        .increment_rate_bucket("k", "retrieve", window, ts(100))
                        .await
                        .unwrap(),
                );
            }
            v
        };
        assert_eq!(counts, vec![1, 2, 3]);

        // Past expiry the same key restarts at 1.
        let n = store
            .increment_rate_bucket("k", "retrieve", window, ts(161))
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.purge_expired_rate_buckets(ts(220)).await.unwrap(), 0);
        assert_eq!(store.purge_expired_rate_buckets(ts(221)).await.unwrap(), 1);
        store.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rate_bucket_concurrent_increments() {
        let (_dir, store) = open_temp().await;
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .increment_rate_bucket("k", "chat", Duration::from_secs(60), ts(0))
                    .await
                    .unwrap()
            }));
        }
        let mut counts = Vec::new();
        for h in handles {
            counts.push(h.await.unwrap());
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=16).collect::<Vec<u32>>());
    }
}
