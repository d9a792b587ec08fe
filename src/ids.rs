//! Identifiers for sessions, groups and units of work.
//!
//! Groups and unit hashes must agree across every node of the cluster, so they
//! are derived with SHA-256 rather than the process-local `DefaultHasher`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Unique identifier of one `run_stream` submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        // Length prefix keeps ("ab", "c") and ("a", "bc") apart.
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Group reached by sending from `parent` into `stage`.
///
/// The root group of a session is `group_hash(session, initial_stage)`.
pub fn group_hash(parent: &str, stage: &str) -> String {
    digest(&["group", parent, stage])
}

/// Identity of a `(session, stage, key)` unit, used for sticky routing and
/// instance memoization.
pub fn unit_hash(session: &str, stage: &str, key: Option<&str>) -> String {
    match key {
        Some(key) => digest(&["unit", session, stage, key]),
        None => digest(&["unit", session, stage]),
    }
}
