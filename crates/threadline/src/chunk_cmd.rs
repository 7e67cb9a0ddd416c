//! Chunk backfill: split pending messages into retrieval chunks.
//!
//! A message is pending while `chunked_at` is unset and its body is
//! non-empty. Each batch is written in three steps (upsert chunks, prune
//! chunks from earlier parameters, mark messages). A crash between steps
//! leaves the message pending, and the retry is a no-op upsert.

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info};

use threadline_core::chunk::ChunkParams;
use threadline_core::keys::chunk_key;
use threadline_core::models::{Chunk, ChunkFilter, ChunkMetadata, ChunkedMark, Message};
use threadline_core::store::Store;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Clone)]
pub struct ChunkOptions {
    pub params: ChunkParams,
    pub batch_messages: usize,
    pub max_messages: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkReport {
    pub batches: u64,
    pub messages: u64,
    pub empty_messages: u64,
    pub chunks: u64,
    pub pruned: u64,
}

/// Build the chunk records for one message.
pub fn chunks_for_message(msg: &Message, params: &ChunkParams) -> Vec<Chunk> {
    let now = Utc::now();
    let metadata = ChunkMetadata::from_message(msg);
    params
        .split(&msg.body)
        .into_iter()
        .enumerate()
        .map(|(i, text)| Chunk {
            chunk_key: chunk_key(&msg.message_key, i, &text),
            thread_key: msg.thread_key.clone(),
            message_key: msg.message_key.clone(),
            chunk_index: i as i64,
            text,
            metadata: metadata.clone(),
            embedding: None,
            embedding_model: None,
            embedding_dims: None,
            embedded_at: None,
            updated_at: now,
        })
        .collect()
}

/// Chunk pending messages until none remain or `max_messages` is reached.
pub async fn chunk_pending(store: &dyn Store, opts: &ChunkOptions) -> Result<ChunkReport> {
    let mut report = ChunkReport::default();
    let batch_size = opts.batch_messages.max(1) as u64;

    loop {
        let limit = match opts.max_messages {
            Some(max) => {
                let remaining = max.saturating_sub(report.messages);
                if remaining == 0 {
                    break;
                }
                remaining.min(batch_size)
            }
            None => batch_size,
        };

        let pending = store.pending_messages(limit as usize).await?;
        if pending.is_empty() {
            break;
        }

        let mut chunks: Vec<Chunk> = Vec::new();
        let mut per_message: Vec<(String, Vec<String>)> = Vec::with_capacity(pending.len());
        for msg in &pending {
            let produced = chunks_for_message(msg, &opts.params);
            if produced.is_empty() {
                report.empty_messages += 1;
            }
            per_message.push((
                msg.message_key.clone(),
                produced.iter().map(|c| c.chunk_key.clone()).collect(),
            ));
            chunks.extend(produced);
        }

        report.chunks += store.upsert_chunks(&chunks).await?;
        for (message_key, keep) in &per_message {
            report.pruned += store.prune_superseded_chunks(message_key, keep).await?;
        }
        let marks: Vec<ChunkedMark> = per_message
            .iter()
            .map(|(message_key, keys)| ChunkedMark {
                message_key: message_key.clone(),
                chunk_count: keys.len() as i64,
            })
            .collect();
        store.mark_messages_chunked(&marks, Utc::now()).await?;

        report.batches += 1;
        report.messages += pending.len() as u64;
        debug!(
            messages = pending.len(),
            chunks = chunks.len(),
            "chunked batch"
        );
    }

    Ok(report)
}

/// `threadline chunk`
pub async fn run_chunk(
    config: &Config,
    reset: bool,
    thread: Option<String>,
    max_messages: Option<u64>,
) -> Result<()> {
    let opts = ChunkOptions {
        params: config.chunking.params()?,
        batch_messages: config.chunking.batch_messages,
        max_messages: max_messages.filter(|m| *m > 0),
    };

    let store = SqliteStore::open(&config.db.path).await?;
    let result = async {
        let mut reset_count = 0;
        if reset {
            let filter = ChunkFilter {
                thread_key: thread.clone(),
                message_key: None,
            };
            reset_count = store.reset_chunked(&filter).await?;
            info!(messages = reset_count, "reset chunked messages");
        }
        let report = chunk_pending(&store, &opts).await?;
        Ok::<_, anyhow::Error>((reset_count, report))
    }
    .await;
    store.close().await;
    let (reset_count, report) = result?;

    println!("chunk");
    println!(
        "  params: max_chars={} overlap_chars={}",
        opts.params.max_chars(),
        opts.params.overlap_chars()
    );
    if reset {
        println!("  messages reset: {}", reset_count);
    }
    println!("  messages chunked: {}", report.messages);
    println!("  empty messages: {}", report.empty_messages);
    println!("  chunks written: {}", report.chunks);
    println!("  superseded chunks removed: {}", report.pruned);
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use threadline_core::store::memory::InMemoryStore;

    use super::*;

    fn message(key: &str, body: &str) -> Message {
        Message {
            thread_key: "t".into(),
            message_key: key.into(),
            order_index: 0,
            sender: Some("a@x.com".into()),
            recipients: vec!["b@x.com".into()],
            timestamp: None,
            timestamp_raw: Some("yesterday".into()),
            subject: Some("Re: plans".into()),
            body: body.into(),
            raw: None,
            updated_at: DateTime::from_timestamp(0, 0).unwrap(),
            chunked_at: None,
            chunk_count: None,
        }
    }

    fn opts(max: usize, overlap: usize) -> ChunkOptions {
        ChunkOptions {
            params: ChunkParams::new(max, overlap).unwrap(),
            batch_messages: 2,
            max_messages: None,
        }
    }

    #[tokio::test]
    async fn test_chunking_is_idempotent() {
        let store = InMemoryStore::new();
        store
            .upsert_messages(&[
                message("m1", "para one\n\npara two"),
                message("m2", &"x".repeat(250)),
                message("m3", "   "),
            ])
            .await
            .unwrap();

        let first = chunk_pending(&store, &opts(100, 10)).await.unwrap();
        assert_eq!(first.messages, 3);
        assert_eq!(first.empty_messages, 1);
        let keys_before: Vec<String> = store
            .list_chunks(&ChunkFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.chunk_key)
            .collect();

        let second = chunk_pending(&store, &opts(100, 10)).await.unwrap();
        assert_eq!(second.messages, 0);

        // A reset re-chunk with the same params produces the same keys.
        store.reset_chunked(&ChunkFilter::default()).await.unwrap();
        chunk_pending(&store, &opts(100, 10)).await.unwrap();
        let keys_after: Vec<String> = store
            .list_chunks(&ChunkFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.chunk_key)
            .collect();
        assert_eq!(keys_before, keys_after);
    }

    #[tokio::test]
    async fn test_marks_and_metadata() {
        let store = InMemoryStore::new();
        store
            .upsert_messages(&[message("m1", "hello"), message("m2", " \n ")])
            .await
            .unwrap();
        chunk_pending(&store, &opts(100, 10)).await.unwrap();

        let msgs = store.thread_messages("t").await.unwrap();
        let counts: Vec<Option<i64>> = msgs.iter().map(|m| m.chunk_count).collect();
        assert!(counts.contains(&Some(1)));
        assert!(counts.contains(&Some(0)));
        assert!(msgs.iter().all(|m| m.chunked_at.is_some()));

        let chunks = store.list_chunks(&ChunkFilter::default()).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.subject.as_deref(), Some("Re: plans"));
        assert_eq!(chunks[0].metadata.recipients, vec!["b@x.com"]);
        assert_eq!(chunks[0].metadata.timestamp_raw.as_deref(), Some("yesterday"));
    }

    #[tokio::test]
    async fn test_rechunk_with_new_params_prunes_old_chunks() {
        let store = InMemoryStore::new();
        store
            .upsert_messages(&[message("m1", &"y".repeat(300))])
            .await
            .unwrap();
        chunk_pending(&store, &opts(100, 0)).await.unwrap();
        assert_eq!(store.stats().await.unwrap().chunks, 3);

        store.reset_chunked(&ChunkFilter::thread("t")).await.unwrap();
        let report = chunk_pending(&store, &opts(200, 0)).await.unwrap();
        // The trailing 100-char window keeps its key at index 1.
        assert_eq!(report.pruned, 2);
        let chunks = store.list_chunks(&ChunkFilter::default()).await.unwrap();
        let lens: Vec<usize> = chunks.iter().map(|c| c.text.chars().count()).collect();
        assert_eq!(lens, vec![200, 100]);
    }

    #[tokio::test]
    async fn test_max_messages_cap() {
        let store = InMemoryStore::new();
        let msgs: Vec<Message> = (0..5)
            .map(|i| message(&format!("m{i}"), "body"))
            .collect();
        store.upsert_messages(&msgs).await.unwrap();

        let mut o = opts(100, 0);
        o.max_messages = Some(3);
        let report = chunk_pending(&store, &o).await.unwrap();
        assert_eq!(report.messages, 3);
        assert_eq!(report.batches, 2);
        assert_eq!(store.stats().await.unwrap().messages_pending, 2);
    }
}
