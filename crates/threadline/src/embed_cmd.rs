//! Embedding backfill: attach vectors to chunks that have none.
//!
//! Pending chunks are selected in store order, embedded one batch per
//! provider call and written back with an update that never inserts. Every
//! vector written in a run must share the dimensionality of the vectors
//! already stored; anything else stops the run with a dimension mismatch.

use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use tracing::{debug, info};

use threadline_core::models::{ChunkFilter, EmbeddingUpdate};
use threadline_core::store::Store;
use threadline_core::Error;

use crate::config::Config;
use crate::embedding::{self, embed_with_retry, EmbeddingProvider, RetryPolicy};
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Clone)]
pub struct EmbedOptions {
    pub batch_size: usize,
    pub max_chunks: Option<u64>,
    pub batch_delay: Duration,
    pub filter: ChunkFilter,
    pub retry: RetryPolicy,
}

impl EmbedOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        let emb = &config.embedding;
        Ok(Self {
            batch_size: emb.batch_size,
            max_chunks: (emb.max_chunks > 0).then_some(emb.max_chunks),
            batch_delay: Duration::from_millis(emb.delay_ms),
            filter: emb.filter()?,
            retry: RetryPolicy::from_config(emb),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbedReport {
    pub batches: u64,
    pub embedded: u64,
    /// Dimensionality of the last batch written.
    pub dims: Option<usize>,
}

fn batch_dims(vectors: &[Vec<f32>]) -> Result<usize> {
    let first = vectors.first().map(Vec::len).unwrap_or(0);
    if first == 0 {
        bail!("provider returned an empty embedding");
    }
    if let Some(v) = vectors.iter().find(|v| v.len() != first) {
        return Err(Error::DimensionMismatch {
            expected: vec![first],
            actual: v.len(),
        }
        .into());
    }
    Ok(first)
}

/// Embed pending chunks until none remain or `max_chunks` is reached.
pub async fn embed_pending(
    store: &dyn Store,
    provider: &dyn EmbeddingProvider,
    opts: &EmbedOptions,
) -> Result<EmbedReport> {
    let mut report = EmbedReport::default();
    let batch_size = opts.batch_size.max(1) as u64;
    let mut known_dims = store.embedding_dims().await?;
    let model = provider.model_name().to_string();

    loop {
        let limit = match opts.max_chunks {
            Some(max) => {
                let remaining = max.saturating_sub(report.embedded);
                if remaining == 0 {
                    info!(max_chunks = max, "chunk cap reached");
                    break;
                }
                remaining.min(batch_size)
            }
            None => batch_size,
        };

        let pending = store.pending_chunks(limit as usize, &opts.filter).await?;
        if pending.is_empty() {
            break;
        }

        let texts: Vec<String> = pending.iter().map(|p| p.text.clone()).collect();
        let vectors = embed_with_retry(provider, &texts, &opts.retry).await?;
        if vectors.len() != pending.len() {
            bail!(
                "provider returned {} embeddings for {} chunks",
                vectors.len(),
                pending.len()
            );
        }

        let dims = batch_dims(&vectors)?;
        if known_dims.iter().any(|&d| d != dims) {
            return Err(Error::DimensionMismatch {
                expected: known_dims,
                actual: dims,
            }
            .into());
        }
        known_dims = vec![dims];

        let now = Utc::now();
        let updates: Vec<EmbeddingUpdate> = pending
            .into_iter()
            .zip(vectors)
            .map(|(chunk, embedding)| EmbeddingUpdate {
                chunk_key: chunk.chunk_key,
                embedding,
                model: model.clone(),
                embedded_at: now,
            })
            .collect();
        let updated = store.update_embeddings(&updates).await?;

        report.batches += 1;
        report.embedded += updates.len() as u64;
        report.dims = Some(dims);
        debug!(chunks = updates.len(), updated, dims, "embedded batch");

        if !opts.batch_delay.is_zero() {
            tokio::time::sleep(opts.batch_delay).await;
        }
    }

    Ok(report)
}

fn print_report(model: &str, report: &EmbedReport) {
    println!("  model: {}", model);
    println!("  batches: {}", report.batches);
    println!("  chunks embedded: {}", report.embedded);
    match report.dims {
        Some(d) => println!("  dims: {}", d),
        None => println!("  dims: n/a"),
    }
    println!("ok");
}

/// `threadline embed pending`
pub async fn run_embed_pending(
    config: &Config,
    limit: Option<u64>,
    batch_size_override: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let mut opts = EmbedOptions::from_config(config)?;
    if let Some(l) = limit {
        opts.max_chunks = (l > 0).then_some(l);
    }
    if let Some(b) = batch_size_override {
        opts.batch_size = b.max(1);
    }

    let store = SqliteStore::open(&config.db.path).await?;

    if dry_run {
        let cap = opts.max_chunks.map(|m| m as usize).unwrap_or(i64::MAX as usize);
        let result = store.pending_chunks(cap, &opts.filter).await;
        store.close().await;
        let pending = result?;
        println!("embed pending (dry-run)");
        println!("  chunks needing embeddings: {}", pending.len());
        println!("ok");
        return Ok(());
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let result = embed_pending(&store, provider.as_ref(), &opts).await;
    store.close().await;
    let report = result?;

    println!("embed pending");
    print_report(provider.model_name(), &report);
    Ok(())
}

/// `threadline embed rebuild`: drop vectors, then backfill them again.
pub async fn run_embed_rebuild(config: &Config, thread: Option<String>) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let mut opts = EmbedOptions::from_config(config)?;
    let scope = ChunkFilter {
        thread_key: thread,
        message_key: None,
    };
    if !scope.is_empty() {
        opts.filter = scope.clone();
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let store = SqliteStore::open(&config.db.path).await?;
    let result = async {
        let cleared = store.clear_embeddings(&scope).await?;
        info!(chunks = cleared, "cleared embeddings");
        let report = embed_pending(&store, provider.as_ref(), &opts).await?;
        Ok::<_, anyhow::Error>((cleared, report))
    }
    .await;
    store.close().await;
    let (cleared, report) = result?;

    println!("embed rebuild");
    println!("  cleared: {}", cleared);
    print_report(provider.model_name(), &report);
    Ok(())
}
