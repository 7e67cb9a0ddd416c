//! Thread inspection for `threadline get`.
//!
//! Loads a thread with its messages in `order_index` order and the chunks
//! each message produced, so ingestion and chunking output can be checked
//! by eye.

use anyhow::{bail, Result};
use serde::Serialize;

use threadline_core::models::{Chunk, ChunkFilter, Message, Thread};
use threadline_core::store::Store;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Clone, Serialize)]
pub struct ThreadView {
    pub thread: ThreadSummary,
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadSummary {
    pub thread_key: String,
    pub thread_id: String,
    pub source_file: String,
    pub subject: Option<String>,
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub message_key: String,
    pub order_index: i64,
    pub sender: Option<String>,
    pub timestamp: Option<String>,
    pub body_chars: usize,
    pub chunked: bool,
    pub chunks: Vec<ChunkView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkView {
    pub index: i64,
    pub chars: usize,
    pub embedded: bool,
    pub text: String,
}

fn summarize(thread: Thread) -> ThreadSummary {
    ThreadSummary {
        thread_key: thread.thread_key,
        thread_id: thread.thread_id,
        source_file: thread.source_file,
        subject: thread.subject,
        participants: thread.participants,
    }
}

fn message_view(msg: Message, chunks: &[Chunk]) -> MessageView {
    let chunks = chunks
        .iter()
        .filter(|c| c.message_key == msg.message_key)
        .map(|c| ChunkView {
            index: c.chunk_index,
            chars: c.text.chars().count(),
            embedded: c.embedding.is_some(),
            text: c.text.clone(),
        })
        .collect();
    MessageView {
        timestamp: msg
            .timestamp
            .map(|t| t.to_rfc3339())
            .or(msg.timestamp_raw),
        body_chars: msg.body.chars().count(),
        chunked: msg.chunked_at.is_some(),
        message_key: msg.message_key,
        order_index: msg.order_index,
        sender: msg.sender,
        chunks,
    }
}

/// Load a thread and everything derived from it.
pub async fn get_thread_view(store: &dyn Store, thread_key: &str) -> Result<ThreadView> {
    let thread = match store.get_thread(thread_key).await? {
        Some(t) => t,
        None => bail!("thread not found: {}", thread_key),
    };
    let messages = store.thread_messages(thread_key).await?;
    let chunks = store.list_chunks(&ChunkFilter::thread(thread_key)).await?;

    Ok(ThreadView {
        thread: summarize(thread),
        messages: messages
            .into_iter()
            .map(|m| message_view(m, &chunks))
            .collect(),
    })
}

/// `threadline get <thread_key>`
pub async fn run_get(config: &Config, thread_key: &str) -> Result<()> {
    let store = SqliteStore::open(&config.db.path).await?;
    let result = get_thread_view(&store, thread_key).await;
    store.close().await;
    let view = result?;

    let t = &view.thread;
    println!("--- thread {} ---", t.thread_key);
    println!("thread_id: {}", t.thread_id);
    println!("source_file: {}", t.source_file);
    println!("subject: {}", t.subject.as_deref().unwrap_or("(none)"));
    println!("participants: {}", t.participants.join(", "));
    println!("messages: {}", view.messages.len());

    for m in &view.messages {
        println!();
        println!(
            "[{}] {} from {} at {}",
            m.order_index,
            m.message_key,
            m.sender.as_deref().unwrap_or("unknown"),
            m.timestamp.as_deref().unwrap_or("unknown")
        );
        let state = if m.chunked { "chunked" } else { "pending" };
        println!(
            "    body: {} chars, {}, {} chunk(s)",
            m.body_chars,
            state,
            m.chunks.len()
        );
        for c in &m.chunks {
            let preview: String = c.text.chars().take(80).collect();
            println!(
                "    #{} {} chars{}: {}",
                c.index,
                c.chars,
                if c.embedded { " [embedded]" } else { "" },
                preview.replace('\n', " ")
            );
        }
    }
    Ok(())
}
