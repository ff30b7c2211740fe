// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Content fingerprints (ETags).
//!
//! A fingerprint is the lowercase hex SHA-256 of a document's canonical form:
//! object keys sorted lexicographically at every depth, compact separators.
//! Two serializations of the same logical document therefore always hash
//! the same, regardless of key order or whitespace.
//!
//! ```
//! use plan_sync::fingerprint::{fingerprint, fingerprint_bytes};
//! use serde_json::json;
//!
//! let a = fingerprint(&json!({"b": 1, "a": [1, 2]}));
//! let b = fingerprint_bytes(br#"{ "a": [1,2], "b": 1 }"#).unwrap();
//! assert_eq!(a, b);
//! assert_eq!(a.len(), 64);
//! ```

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Rebuild a value with object keys in sorted order at every depth.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::with_capacity(map.len());
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key.as_str()]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Canonical compact serialization of a value.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    // Serializing a Value cannot fail: keys are always strings.
    serde_json::to_vec(&canonicalize(value)).unwrap_or_default()
}

/// Fingerprint of a JSON value.
#[must_use]
pub fn fingerprint(value: &Value) -> String {
    hex::encode(Sha256::digest(canonical_bytes(value)))
}

/// Fingerprint of stored bytes. Fails only if the bytes are not JSON.
pub fn fingerprint_bytes(bytes: &[u8]) -> Result<String, serde_json::Error> {
    let value: Value = serde_json::from_slice(bytes)?;
    Ok(fingerprint(&value))
}

/// Compare a client-supplied token with a server fingerprint.
///
/// HTTP clients commonly send ETags quoted (`"abc"`) or weak (`W/"abc"`);
/// both forms match the bare digest.
#[must_use]
pub fn matches(client_token: &str, server: &str) -> bool {
    let token = client_token.trim();
    let token = token.strip_prefix("W/").unwrap_or(token);
    let token = token.trim_matches('"');
    token.eq_ignore_ascii_case(server)
}
