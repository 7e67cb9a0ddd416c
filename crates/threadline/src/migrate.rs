//! Idempotent schema setup.
//!
//! Every statement uses `IF NOT EXISTS`, so migrations run on each
//! [`SqliteStore::open`](crate::sqlite_store::SqliteStore::open).
//! Times are stored as Unix milliseconds.

use anyhow::Result;
use sqlx::SqlitePool;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS threads (
        thread_key TEXT PRIMARY KEY,
        thread_id TEXT NOT NULL,
        source_file TEXT NOT NULL,
        subject TEXT,
        message_count INTEGER,
        participants_json TEXT NOT NULL DEFAULT '[]',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        message_key TEXT PRIMARY KEY,
        thread_key TEXT NOT NULL,
        order_index INTEGER NOT NULL,
        sender TEXT,
        recipients_json TEXT NOT NULL DEFAULT '[]',
        timestamp INTEGER,
        timestamp_raw TEXT,
        subject TEXT,
        body TEXT NOT NULL,
        raw_json TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        chunked_at INTEGER,
        chunk_count INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        chunk_key TEXT PRIMARY KEY,
        thread_key TEXT NOT NULL,
        message_key TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        text TEXT NOT NULL,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        embedding BLOB,
        embedding_model TEXT,
        embedding_dims INTEGER,
        embedded_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rate_limits (
        bucket_key TEXT PRIMARY KEY,
        bucket TEXT NOT NULL,
        count INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_thread_order ON messages(thread_key, order_index)",
    "CREATE INDEX IF NOT EXISTS idx_messages_pending ON messages(message_key) WHERE chunked_at IS NULL",
    "CREATE INDEX IF NOT EXISTS idx_chunks_owner ON chunks(thread_key, message_key, chunk_index)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_message ON chunks(message_key)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_unembedded ON chunks(chunk_key) WHERE embedding IS NULL",
    "CREATE INDEX IF NOT EXISTS idx_rate_limits_expires_at ON rate_limits(expires_at)",
];

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
