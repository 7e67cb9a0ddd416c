//! Typed errors raised by core operations.
//!
//! Core functions return [`anyhow::Result`] like the rest of the workspace.
//! When a caller needs to react to a specific failure (for example the HTTP
//! layer mapping a rate-limit rejection to `429`), it recovers the variant
//! with `err.downcast_ref::<Error>()`.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Configuration that can never produce a valid run.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A request that fails validation (bad topK, empty query, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Query or batch vectors do not match the dimensionality already
    /// stored in the corpus.
    #[error("embedding dimension mismatch: got {actual}, corpus has {expected:?}")]
    DimensionMismatch { expected: Vec<usize>, actual: usize },

    /// The caller exhausted its quota for the current window.
    #[error("rate limit exceeded for bucket '{bucket}'")]
    RateLimited { bucket: String },
}
