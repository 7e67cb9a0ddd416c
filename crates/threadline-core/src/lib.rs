//! # Threadline Core
//!
//! Storage-agnostic logic for Threadline: data models, content-addressed
//! keys, the overlapping text chunker, the [`store::Store`] trait with an
//! in-memory implementation, the fixed-window rate limiter, and the
//! retrieval algorithm.
//!
//! This crate contains no network clients, database drivers, or runtime
//! dependencies. The `threadline` app crate provides the SQLite store,
//! the dataset and embedding clients, and the CLI.

pub mod chunk;
pub mod error;
pub mod keys;
pub mod models;
pub mod rate_limit;
pub mod search;
pub mod store;
pub mod vector;

pub use error::Error;
