use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::StoreResult;

// ============================================================================
// Identity & Hashing
// ============================================================================
//
// Locks are keyed by the hash of an arbitrary caller-supplied value, so any
// serializable shape can be locked without a dedicated column per use case.
//
// ============================================================================

/// Hex-encoded SHA-256 of a value's canonical JSON form.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct LockKey(String);

impl LockKey {
    pub fn from_value<T: Serialize + ?Sized>(value: &T) -> StoreResult<Self> {
        Ok(Self(hash_value(value)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic hash of any serializable value.
///
/// Object keys are re-inserted in sorted order before hashing, so two maps
/// with the same entries hash the same no matter how they were built.
pub fn hash_value<T: Serialize + ?Sized>(value: &T) -> StoreResult<String> {
    let canonical = serde_json::to_string(&canonicalize(serde_json::to_value(value)?))?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, canonicalize(value)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Fresh identifier for events, lease tokens and queue items.
pub fn new_id() -> Uuid {
    Uuid::new_v4()
}
