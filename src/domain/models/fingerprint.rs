//! Task fingerprinting for dedup and result caching.
//!
//! The fingerprint is a stable SHA-256 over the task's semantic
//! identity: kind, canonicalized payload, and the capability flags
//! that affect execution. It is never used for security.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::provider::CapabilityFlags;
use super::task::{Task, TaskKind, TaskPayload};

/// Stable hash of a task's semantic identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// Compute the fingerprint of (kind, payload, flags).
    pub fn compute(kind: &TaskKind, payload: &TaskPayload, flags: &CapabilityFlags) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(&payload.data);
        hasher.update([0u8]);
        hasher.update(canonical_json(&payload.metadata).as_bytes());
        hasher.update([0u8]);
        hasher.update([u8::from(flags.streaming), u8::from(flags.batching)]);
        Self(hex_encode(&hasher.finalize()))
    }

    pub fn of_task(task: &Task) -> Self {
        Self::compute(&task.kind, &task.payload, &task.required_flags)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Cheap shard index derived from the leading hex bytes.
    pub fn shard(&self, shard_count: usize) -> usize {
        debug_assert!(shard_count > 0);
        let byte = u8::from_str_radix(self.0.get(..2).unwrap_or("00"), 16).unwrap_or(0);
        usize::from(byte) % shard_count
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Render JSON with object keys sorted so that semantically equal
/// payloads hash identically regardless of construction order.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let entries: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", entries.join(","))
        }
        serde_json::Value::Array(items) => {
            let entries: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", entries.join(","))
        }
        other => other.to_string(),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut acc, b| {
        let _ = write!(acc, "{b:02x}");
        acc
    })
}
