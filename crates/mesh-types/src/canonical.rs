//! Canonical JSON encoding.
//!
//! Every structure that is hashed or signed on the wire goes through this
//! encoding so all nodes derive the same bytes:
//!
//! 1. Object keys sorted lexicographically (UTF-8 byte order)
//! 2. Compact representation, no whitespace
//! 3. Fields with null values omitted
//!
//! Requirement hashes (DHT routing targets) and result hashes use SHA-256
//! over this encoding.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanonicalError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CanonicalError>;

/// Serialize a value to its canonical JSON string.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let json_value = serde_json::to_value(value)?;
    let canonical = canonicalize_value(json_value);
    Ok(serde_json::to_string(&canonical)?)
}

/// SHA-256 digest of the canonical JSON representation.
pub fn canonical_sha256<T: Serialize>(value: &T) -> Result<[u8; 32]> {
    let canonical = to_canonical_json(value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hasher.finalize().into())
}

fn canonicalize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, canonicalize_value(v)))
                .collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize_value).collect()),
        other => other,
    }
}
