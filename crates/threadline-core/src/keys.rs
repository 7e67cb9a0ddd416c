//! Content-addressed identity for every stored record.
//!
//! All keys are SHA-256 digests rendered as 64 lowercase hex characters.
//! Inputs are joined with `"::"` before hashing, so the same semantic
//! input always produces the same key and every downstream write can be an
//! idempotent upsert.
//!
//! | Record | Hashed input |
//! |--------|--------------|
//! | Thread | `source_file :: thread_id` |
//! | Message | `thread_key :: order_index :: canonical_json` |
//! | Chunk | `message_key :: chunk_index :: text` |
//! | Rate-limit bucket | `salt :: bucket :: client_id :: window_secs` |

use sha2::{Digest, Sha256};

/// Hash a string to lowercase hex SHA-256.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn thread_key(source_file: &str, thread_id: &str) -> String {
    sha256_hex(&format!("{}::{}", source_file, thread_id))
}

/// Identity of a message within its thread.
///
/// `canonical_json` must be a canonical serialization of the raw message
/// (see [`canonical_json`]) so that two ingestions of the same row agree.
pub fn message_key(thread_key: &str, order_index: usize, canonical_json: &str) -> String {
    sha256_hex(&format!("{}::{}::{}", thread_key, order_index, canonical_json))
}

/// Identity of a chunk. Includes the text, so different chunking
/// parameters produce different keys rather than mutating old chunks.
pub fn chunk_key(message_key: &str, chunk_index: usize, text: &str) -> String {
    sha256_hex(&format!("{}::{}::{}", message_key, chunk_index, text))
}

pub fn rate_limit_key(salt: &str, bucket: &str, client_id: &str, window_secs: u64) -> String {
    sha256_hex(&format!("{}::{}::{}::{}", salt, bucket, client_id, window_secs))
}

/// Serialize a JSON value with object keys in sorted order.
///
/// `serde_json::Map` is a `BTreeMap` unless the `preserve_order` feature is
/// enabled anywhere in the dependency graph, so objects are rebuilt
/// explicitly to keep the output independent of feature unification.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn sorted(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serde_json::Map::new();
                for (k, v) in entries {
                    out.insert(k.clone(), sorted(v));
                }
                serde_json::Value::Object(out)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sorted).collect())
            }
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}
