//! Core data models used throughout Threadline.
//!
//! These types represent the threads, messages, chunks, and retrieval hits
//! that flow through the ingestion and retrieval pipeline. Timestamps that
//! only the store manages (`created_at`) are not carried here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of participants recorded on a thread.
pub const MAX_PARTICIPANTS: usize = 500;

/// One source conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Thread {
    pub thread_key: String,
    pub thread_id: String,
    pub source_file: String,
    pub subject: Option<String>,
    pub message_count: Option<i64>,
    pub participants: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// One email within a thread.
///
/// `chunked_at` / `chunk_count` belong to the chunker. Ingestion upserts
/// never write them, so re-ingesting a row keeps a processed message
/// processed.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub thread_key: String,
    pub message_key: String,
    pub order_index: i64,
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub timestamp_raw: Option<String>,
    pub subject: Option<String>,
    pub body: String,
    /// Canonical raw JSON, only kept when raw retention is enabled.
    pub raw: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub chunked_at: Option<DateTime<Utc>>,
    pub chunk_count: Option<i64>,
}

/// Snapshot of message fields taken when a chunk is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub order_index: i64,
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub timestamp_raw: Option<String>,
    pub subject: Option<String>,
}

impl ChunkMetadata {
    pub fn from_message(msg: &Message) -> Self {
        Self {
            order_index: msg.order_index,
            sender: msg.sender.clone(),
            recipients: msg.recipients.clone(),
            timestamp: msg.timestamp,
            timestamp_raw: msg.timestamp_raw.clone(),
            subject: msg.subject.clone(),
        }
    }
}

/// One retrieval unit of text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub chunk_key: String,
    pub thread_key: String,
    pub message_key: String,
    pub chunk_index: i64,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
    pub embedding_dims: Option<usize>,
    pub embedded_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Marks a message as processed by the chunker.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkedMark {
    pub message_key: String,
    pub chunk_count: i64,
}

/// A chunk selected for embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChunk {
    pub chunk_key: String,
    pub text: String,
}

/// Vector produced for a chunk. Applied as an update, never an insert.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingUpdate {
    pub chunk_key: String,
    pub embedding: Vec<f32>,
    pub model: String,
    pub embedded_at: DateTime<Utc>,
}

/// Equality filter on chunk ownership.
///
/// Used both to narrow the embedding backfill and as the metadata filter
/// of a retrieval query. Unknown fields are rejected so a typo in
/// `EMBED_QUERY_FILTER` fails loudly instead of selecting everything.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChunkFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_key: Option<String>,
}

impl ChunkFilter {
    pub fn is_empty(&self) -> bool {
        self.thread_key.is_none() && self.message_key.is_none()
    }

    pub fn thread(thread_key: impl Into<String>) -> Self {
        Self {
            thread_key: Some(thread_key.into()),
            message_key: None,
        }
    }

    /// Whether a chunk owned by the given keys passes the filter.
    pub fn matches(&self, thread_key: &str, message_key: &str) -> bool {
        self.thread_key.as_deref().map_or(true, |k| k == thread_key)
            && self.message_key.as_deref().map_or(true, |k| k == message_key)
    }
}

/// A ranked, citable retrieval result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHit {
    pub chunk_key: String,
    pub thread_key: String,
    pub message_key: String,
    pub chunk_index: i64,
    pub text: String,
    pub metadata: ChunkMetadata,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub score: f64,
}

/// Record counts for `threadline stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub threads: u64,
    pub messages: u64,
    pub messages_pending: u64,
    pub chunks: u64,
    pub chunks_embedded: u64,
    pub chunks_pending: u64,
    /// Distinct vector dimensionalities present in the corpus.
    pub embedding_dims: Vec<usize>,
}
