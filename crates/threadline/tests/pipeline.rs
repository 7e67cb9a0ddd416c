//! End-to-end pipeline runs against a temporary SQLite database with an
//! in-process row source and embedding provider.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use threadline::chunk_cmd::{chunk_pending, ChunkOptions};
use threadline::dataset::{RowEnvelope, RowSource, RowsPage};
use threadline::embed_cmd::{embed_pending, EmbedOptions};
use threadline::embedding::{embed_query, EmbeddingProvider, ProviderError, RetryPolicy};
use threadline::generation::TextGenerator;
use threadline::ingest::{ingest_rows, IngestOptions};
use threadline::retrieve::{RetrievalService, RetrieveRequest};
use threadline::sqlite_store::SqliteStore;
use threadline_core::chunk::ChunkParams;
use threadline_core::models::ChunkFilter;
use threadline_core::rate_limit::{RateLimitRule, RateLimiter};
use threadline_core::search::{retrieve, CandidatePolicy, RetrievalLimits, RetrieveParams};
use threadline_core::store::Store;
use threadline_core::Error;

struct FixedRows(Vec<Value>);

#[async_trait]
impl RowSource for FixedRows {
    async fn fetch_page(&self, offset: u64, length: usize) -> Result<RowsPage> {
        let rows = self
            .0
            .iter()
            .enumerate()
            .skip(offset as usize)
            .take(length)
            .map(|(i, row)| RowEnvelope {
                row_idx: Some(i as u64),
                row: row.clone(),
            })
            .collect();
        Ok(RowsPage {
            rows,
            num_rows_total: Some(self.0.len() as u64),
        })
    }
}

/// One axis per topic word, so similarity is exact.
struct TopicEmbedder {
    calls: AtomicUsize,
}

impl TopicEmbedder {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for TopicEmbedder {
    fn model_name(&self) -> &str {
        "topic-test"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| {
                let t = t.to_lowercase();
                vec![
                    if t.contains("budget") { 1.0 } else { 0.0 },
                    if t.contains("flight") { 1.0 } else { 0.0 },
                    if t.contains("garden") { 1.0 } else { 0.0 },
                    0.1,
                ]
            })
            .collect())
    }
}

struct CannedGenerator;

#[async_trait]
impl TextGenerator for CannedGenerator {
    fn model_name(&self) -> &str {
        "canned"
    }

    async fn generate(&self, _prompt: &str) -> Result<String, ProviderError> {
        Ok("See [1].".to_string())
    }
}

fn rows() -> Vec<Value> {
    vec![
        json!({
            "thread_id": "1",
            "source_file": "mail-a.txt",
            "subject": "Q3 budget",
            "messages": [
                {"from": "Ann <ann@x.com>", "to": ["bob@x.com"], "date": "2015-03-02T10:00:00Z",
                 "body": "The budget for Q3 is attached.\n\nPlease review the numbers."},
                {"from": "bob@x.com", "to": "ann@x.com", "body": "Looks fine to me."}
            ]
        }),
        json!({
            "thread_id": "2",
            "source_file": "mail-a.txt",
            "subject": "Trip",
            "messages": json!([
                {"from": "cy@x.com", "body": "Your flight leaves at 9am."}
            ]).to_string()
        }),
        json!({
            "thread_id": "3",
            "source_file": "mail-b.txt",
            "messages": [
                {"sender": "dee@x.com", "text": "The garden needs water."},
                {"from": "eve@x.com", "body": ""}
            ]
        }),
    ]
}

fn ingest_opts() -> IngestOptions {
    IngestOptions {
        page_size: 2,
        start_offset: 0,
        max_rows: None,
        page_delay: Duration::ZERO,
        store_raw: true,
    }
}

fn chunk_opts() -> ChunkOptions {
    ChunkOptions {
        params: ChunkParams::new(40, 5).unwrap(),
        batch_messages: 3,
        max_messages: None,
    }
}

fn no_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        max_jitter: Duration::ZERO,
    }
}

fn embed_opts() -> EmbedOptions {
    EmbedOptions {
        batch_size: 2,
        max_chunks: None,
        batch_delay: Duration::ZERO,
        filter: ChunkFilter::default(),
        retry: no_retry(),
    }
}

async fn run_pipeline(store: &SqliteStore, embedder: &TopicEmbedder) {
    ingest_rows(store, &FixedRows(rows()), &ingest_opts())
        .await
        .unwrap();
    chunk_pending(store, &chunk_opts()).await.unwrap();
    embed_pending(store, embedder, &embed_opts()).await.unwrap();
}

#[tokio::test]
async fn test_pipeline_is_idempotent_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&tmp.path().join("t.sqlite")).await.unwrap();
    let embedder = TopicEmbedder::new();

    run_pipeline(&store, &embedder).await;
    let first = store.stats().await.unwrap();
    assert_eq!(first.threads, 3);
    assert_eq!(first.messages, 5);
    // The empty body never becomes pending.
    assert_eq!(first.messages_pending, 0);
    assert!(first.chunks >= 4);
    assert_eq!(first.chunks_embedded, first.chunks);
    assert_eq!(first.embedding_dims, vec![4]);
    let calls = embedder.calls.load(Ordering::SeqCst);

    run_pipeline(&store, &embedder).await;
    let second = store.stats().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), calls);

    store.close().await;
}

#[tokio::test]
async fn test_top_hit_matches_query_topic() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&tmp.path().join("t.sqlite")).await.unwrap();
    let embedder = TopicEmbedder::new();
    run_pipeline(&store, &embedder).await;

    let params = RetrieveParams::resolve(
        Some(3),
        None,
        None,
        CandidatePolicy::Retrieval,
        RetrievalLimits::default(),
    )
    .unwrap();
    let vector = embed_query(&embedder, "when is my flight?", &no_retry())
        .await
        .unwrap();
    let hits = retrieve(&store, &vector, &params).await.unwrap();
    assert_eq!(hits.len(), 3);
    assert!(hits[0].text.contains("flight"));
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));

    // Filtering to another thread excludes the best match.
    let garden_thread = threadline_core::keys::thread_key("mail-b.txt", "3");
    let params = RetrieveParams::resolve(
        Some(3),
        None,
        Some(ChunkFilter::thread(garden_thread.clone())),
        CandidatePolicy::Retrieval,
        RetrievalLimits::default(),
    )
    .unwrap();
    let hits = retrieve(&store, &vector, &params).await.unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|h| h.thread_key == garden_thread));

    store.close().await;
}

#[tokio::test]
async fn test_query_dimension_mismatch_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open(&tmp.path().join("t.sqlite")).await.unwrap();
    run_pipeline(&store, &TopicEmbedder::new()).await;

    let params = RetrieveParams::resolve(
        None,
        None,
        None,
        CandidatePolicy::Retrieval,
        RetrievalLimits::default(),
    )
    .unwrap();
    let err = retrieve(&store, &[1.0, 0.0], &params).await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<Error>(),
        Some(&Error::DimensionMismatch {
            expected: vec![4],
            actual: 2
        })
    );
    store.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_respect_rate_limit() {
    let tmp = TempDir::new().unwrap();
    let sqlite = SqliteStore::open(&tmp.path().join("t.sqlite")).await.unwrap();
    run_pipeline(&sqlite, &TopicEmbedder::new()).await;
    let store: Arc<dyn Store> = Arc::new(sqlite);

    let service = Arc::new(RetrievalService {
        store,
        embedder: Arc::new(TopicEmbedder::new()),
        generator: Arc::new(CannedGenerator),
        limiter: RateLimiter::new("test-salt"),
        retrieve_rule: RateLimitRule::new("retrieve", 60, 5).unwrap(),
        chat_rule: RateLimitRule::new("chat", 60, 5).unwrap(),
        limits: RetrievalLimits::default(),
        retry: no_retry(),
    });

    let mut handles = Vec::new();
    for _ in 0..20 {
        let svc = service.clone();
        handles.push(tokio::spawn(async move {
            svc.retrieve(
                "198.51.100.4",
                RetrieveRequest {
                    query: "budget".into(),
                    top_k: None,
                    num_candidates: None,
                    filter: None,
                },
            )
            .await
        }));
    }

    let mut allowed = 0;
    let mut limited = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => allowed += 1,
            Err(e) => {
                assert!(matches!(
                    e.downcast_ref::<Error>(),
                    Some(Error::RateLimited { .. })
                ));
                limited += 1;
            }
        }
    }
    assert_eq!(allowed, 5);
    assert_eq!(limited, 15);
}
