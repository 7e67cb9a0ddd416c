//! Corpus statistics for `threadline stats`.
//!
//! Shows how far each stage has progressed and flags a corpus that holds
//! vectors of more than one dimensionality, which makes retrieval fail.

use anyhow::Result;

use threadline_core::models::StoreStats;
use threadline_core::store::Store;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

/// Warning for a corpus whose vectors cannot all be compared.
pub fn mixed_dims_warning(dims: &[usize]) -> Option<String> {
    if dims.len() <= 1 {
        return None;
    }
    let list: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
    Some(format!(
        "stored embeddings have {} dimensionalities ({}); run `threadline embed rebuild`",
        dims.len(),
        list.join(", ")
    ))
}

fn percent(part: u64, whole: u64) -> u64 {
    if whole == 0 {
        0
    } else {
        part * 100 / whole
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn print_stats(config: &Config, stats: &StoreStats) {
    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Threadline corpus stats");
    println!("=======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Threads:     {}", stats.threads);
    println!(
        "  Messages:    {} ({} pending chunking)",
        stats.messages, stats.messages_pending
    );
    println!("  Chunks:      {}", stats.chunks);
    println!(
        "  Embedded:    {} / {} ({}%, {} pending)",
        stats.chunks_embedded,
        stats.chunks,
        percent(stats.chunks_embedded, stats.chunks),
        stats.chunks_pending
    );
    let dims = if stats.embedding_dims.is_empty() {
        "none".to_string()
    } else {
        stats
            .embedding_dims
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    println!("  Dims:        {}", dims);
}

/// `threadline stats`
pub async fn run_stats(config: &Config) -> Result<()> {
    let store = SqliteStore::open(&config.db.path).await?;
    let result = store.stats().await;
    store.close().await;
    let stats = result?;

    print_stats(config, &stats);
    if let Some(warning) = mixed_dims_warning(&stats.embedding_dims) {
        tracing::warn!("{}", warning);
        println!();
        println!("  Warning: {}", warning);
    }
    Ok(())
}
