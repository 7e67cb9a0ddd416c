//! Dataset ingestion: pages of rows → normalized threads and messages → store.
//!
//! Every write is an upsert keyed by content hash, so re-running over the
//! same offsets only refreshes `updated_at`. Chunking state on existing
//! messages is never touched here.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use threadline_core::models::{Message, Thread};
use threadline_core::store::Store;

use crate::config::Config;
use crate::dataset::{HttpRowSource, RowSource};
use crate::normalize::normalize_row;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub page_size: usize,
    pub start_offset: u64,
    /// Stop after this many rows have been requested.
    pub max_rows: Option<u64>,
    pub page_delay: Duration,
    pub store_raw: bool,
}

impl IngestOptions {
    pub fn from_config(config: &Config) -> Self {
        let ds = &config.dataset;
        Self {
            page_size: ds.page_size,
            start_offset: ds.start_offset,
            max_rows: (ds.max_rows > 0).then_some(ds.max_rows),
            page_delay: Duration::from_millis(ds.delay_ms),
            store_raw: ds.store_raw_message,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub pages: u64,
    pub rows: u64,
    pub rows_skipped: u64,
    pub threads: u64,
    pub messages: u64,
    /// Offset the next run should start from to continue.
    pub next_offset: u64,
    pub total_rows: Option<u64>,
}

/// Pull pages from `source` until it is exhausted or a cap is reached.
pub async fn ingest_rows(
    store: &dyn Store,
    source: &dyn RowSource,
    opts: &IngestOptions,
) -> Result<IngestReport> {
    let page_size = opts.page_size.max(1);
    let mut report = IngestReport {
        next_offset: opts.start_offset,
        ..Default::default()
    };
    let mut offset = opts.start_offset;

    loop {
        let length = match opts.max_rows {
            Some(max) => {
                let remaining = max.saturating_sub(offset - opts.start_offset);
                if remaining == 0 {
                    info!(max_rows = max, "row cap reached");
                    break;
                }
                remaining.min(page_size as u64) as usize
            }
            None => page_size,
        };

        let page = source.fetch_page(offset, length).await?;
        if report.total_rows.is_none() {
            report.total_rows = page.num_rows_total.filter(|t| *t > 0);
        }
        if page.rows.is_empty() {
            info!(offset, "empty page; done");
            break;
        }

        let now = Utc::now();
        let mut threads: Vec<Thread> = Vec::with_capacity(page.rows.len());
        let mut messages: Vec<Message> = Vec::new();
        for envelope in &page.rows {
            match normalize_row(&envelope.row, opts.store_raw, now) {
                Ok(normalized) => {
                    threads.push(normalized.thread);
                    messages.extend(normalized.messages);
                }
                Err(e) => {
                    warn!(row_idx = ?envelope.row_idx, offset, error = %e, "skipping row");
                    report.rows_skipped += 1;
                }
            }
        }

        // Independent batches: both are attempted before either error surfaces.
        let (thread_result, message_result) = tokio::join!(
            store.upsert_threads(&threads),
            store.upsert_messages(&messages)
        );
        report.threads += thread_result?;
        report.messages += message_result?;

        let fetched = page.rows.len() as u64;
        offset += fetched;
        report.pages += 1;
        report.rows += fetched;
        report.next_offset = offset;
        info!(
            offset,
            rows = fetched,
            threads = threads.len(),
            messages = messages.len(),
            "ingested page"
        );

        if let Some(total) = report.total_rows {
            if offset >= opts.start_offset + total {
                break;
            }
        }
        if !opts.page_delay.is_zero() {
            tokio::time::sleep(opts.page_delay).await;
        }
    }

    Ok(report)
}

/// `threadline ingest`
pub async fn run_ingest(
    config: &Config,
    max_rows: Option<u64>,
    start_offset: Option<u64>,
) -> Result<()> {
    let mut opts = IngestOptions::from_config(config);
    if let Some(m) = max_rows {
        opts.max_rows = (m > 0).then_some(m);
    }
    if let Some(o) = start_offset {
        opts.start_offset = o;
    }

    let ds = &config.dataset;
    info!(
        dataset = %ds.dataset,
        config = %ds.config,
        split = %ds.split,
        start_offset = opts.start_offset,
        "starting ingest"
    );

    let source = HttpRowSource::new(ds)?;
    let store = SqliteStore::open(&config.db.path).await?;
    let result = ingest_rows(&store, &source, &opts).await;
    store.close().await;
    let report = result?;

    println!("ingest {}", ds.dataset);
    println!("  pages: {}", report.pages);
    println!("  rows: {} ({} skipped)", report.rows, report.rows_skipped);
    println!("  threads upserted: {}", report.threads);
    println!("  messages upserted: {}", report.messages);
    match report.total_rows {
        Some(t) => println!("  reported total rows: {}", t),
        None => println!("  reported total rows: unknown"),
    }
    println!("  next offset: {}", report.next_offset);
    println!("ok");
    Ok(())
}
