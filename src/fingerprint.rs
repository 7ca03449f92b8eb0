//! Change fingerprints
//!
//! A fingerprint is the lowercase hex SHA-256 of some input. Structured values
//! are hashed through canonical JSON (object keys sorted) so that two equal
//! values always produce the same fingerprint regardless of map ordering.

use crate::error::{FleetError, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Number of hex characters in a guard ID
pub const GUARD_ID_LEN: usize = 8;

/// Hex SHA-256 of raw bytes
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Fingerprint of any serializable value, via canonical JSON.
///
/// Fails when the value cannot be expressed as JSON, for example a map keyed
/// by something other than strings.
pub fn fingerprint_value<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let json = serde_json::to_value(value)
        .map_err(|e| FleetError::Fingerprint(format!("unable to serialize value: {}", e)))?;
    let canonical = canonicalize(json);
    let bytes = serde_json::to_vec(&canonical)
        .map_err(|e| FleetError::Fingerprint(format!("unable to encode value: {}", e)))?;
    Ok(fingerprint(&bytes))
}

/// Combine several fingerprints into one signal
pub fn combine(parts: &[&str]) -> String {
    fingerprint(parts.concat().as_bytes())
}

/// Short, stable identifier derived from a node group name
pub fn guard_id(name: &str) -> String {
    let mut full = fingerprint(name.as_bytes());
    full.truncate(GUARD_ID_LEN);
    full
}

// Object keys sorted at every level.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
