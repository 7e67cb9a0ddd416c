//! `threadline search`: vector retrieval from the command line.
//!
//! Same retrieval path as `POST /retrieve`, without rate limiting.

use anyhow::{bail, Result};

use threadline_core::models::ChunkFilter;
use threadline_core::search::{self, validate_query, CandidatePolicy, RetrieveParams};

use crate::config::Config;
use crate::embedding::{self, embed_query, RetryPolicy};
use crate::sqlite_store::SqliteStore;

pub async fn run_search(
    config: &Config,
    query: &str,
    top_k: Option<i64>,
    thread: Option<String>,
    message: Option<String>,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    if !config.embedding.is_enabled() {
        bail!("Search requires embeddings. Set [embedding] provider in config.");
    }

    let query = validate_query(query)?;
    let filter = ChunkFilter {
        thread_key: thread,
        message_key: message,
    };
    let params = RetrieveParams::resolve(
        top_k,
        None,
        Some(filter),
        CandidatePolicy::Retrieval,
        config.retrieval.limits(),
    )?;

    let provider = embedding::create_provider(&config.embedding)?;
    let vector = embed_query(
        provider.as_ref(),
        query,
        &RetryPolicy::from_config(&config.embedding),
    )
    .await?;

    let store = SqliteStore::open(&config.db.path).await?;
    let result = search::retrieve(&store, &vector, &params).await;
    store.close().await;
    let hits = result?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let meta = &hit.metadata;
        println!(
            "{}. [{:.4}] {}",
            i + 1,
            hit.score,
            meta.subject.as_deref().unwrap_or("(no subject)")
        );
        println!(
            "    from: {}",
            meta.sender.as_deref().unwrap_or("unknown")
        );
        if let Some(date) = meta
            .timestamp
            .map(|t| t.to_rfc3339())
            .or_else(|| meta.timestamp_raw.clone())
        {
            println!("    date: {}", date);
        }
        let snippet: String = hit.text.chars().take(200).collect();
        println!("    > {}", snippet.replace('\n', " "));
        println!("    thread: {}  chunk: {}#{}", hit.thread_key, hit.message_key, hit.chunk_index);
        println!();
    }
    Ok(())
}
