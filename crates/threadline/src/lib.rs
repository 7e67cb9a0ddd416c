//! # Threadline
//!
//! Retrieval over an email-thread dataset: page rows from a remote dataset,
//! normalize them into threads and messages, split message bodies into
//! overlapping chunks, attach embeddings, and answer vector queries with
//! per-client rate limiting.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────────┐   ┌─────────┐   ┌─────────┐
//! │  Dataset  │──▶│  Ingest   │──▶│  Chunk  │──▶│  Embed  │
//! │  /rows    │   │ normalize │   │         │   │ backfill│
//! └───────────┘   └─────┬─────┘   └────┬────┘   └────┬────┘
//!                       └──────────────┼─────────────┘
//!                                      ▼
//!                                ┌──────────┐
//!                                │  SQLite  │
//!                                └────┬─────┘
//!                         ┌───────────┴───────────┐
//!                         ▼                       ▼
//!                    ┌──────────┐          ┌────────────┐
//!                    │   CLI    │          │ HTTP       │
//!                    │          │          │ /retrieve  │
//!                    └──────────┘          │ /chat      │
//!                                          └────────────┘
//! ```
//!
//! Every stage is a resumable backfill: pending work is recomputed from
//! stored state and every write is keyed by a content hash.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML + environment configuration |
//! | [`dataset`] | Paginated dataset client with retries |
//! | [`normalize`] | Row → thread and message normalization |
//! | [`ingest`] | Ingest stage |
//! | [`chunk_cmd`] | Chunk stage |
//! | [`embedding`] | Embedding providers and retry policy |
//! | [`embed_cmd`] | Embedding backfill stage |
//! | [`generation`] | Answer generation for `/chat` |
//! | [`retrieve`] | Rate-limited retrieval and chat service |
//! | [`server`] | axum HTTP server |
//! | [`sqlite_store`] | SQLite [`Store`](threadline_core::store::Store) |
//! | [`db`] / [`migrate`] | Connection pool and schema |

pub mod chunk_cmd;
pub mod config;
pub mod dataset;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod generation;
pub mod get;
pub mod ingest;
pub mod migrate;
pub mod normalize;
pub mod retrieve;
pub mod search_cmd;
pub mod server;
pub mod sqlite_store;
pub mod stats;
