use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Unique identifier of a task and of the result it produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(String);

impl TaskKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Deterministic key derived from a content fingerprint.
    ///
    /// Two calls with the same function name and the same encoded arguments
    /// produce the same key, which is what makes pure submissions deduplicate.
    pub fn fingerprint(prefix: &str, content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(prefix.as_bytes());
        hasher.update([0u8]);
        hasher.update(content);
        let digest = hasher.finalize();
        let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
        Self(format!("{prefix}-{hex}"))
    }

    /// Fresh random key, never equal to any other.
    pub fn random(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Address of a worker. A restarted worker always gets a new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh worker address (`worker-<8 hex>`).
    pub fn generate() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self(format!("worker-{}", &id[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", &self.0.simple().to_string()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let a = TaskKey::fingerprint("inc", b"\x01");
        let b = TaskKey::fingerprint("inc", b"\x01");
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("inc-"));
        assert_eq!(a.as_str().len(), "inc-".len() + 16);
    }

    #[test]
    fn fingerprint_depends_on_prefix_and_content() {
        let a = TaskKey::fingerprint("inc", b"\x01");
        assert_ne!(a, TaskKey::fingerprint("dec", b"\x01"));
        assert_ne!(a, TaskKey::fingerprint("inc", b"\x02"));
    }

    #[test]
    fn random_keys_differ() {
        assert_ne!(TaskKey::random("f"), TaskKey::random("f"));
    }

    #[test]
    fn worker_ids_are_unique() {
        let a = WorkerId::generate();
        assert!(a.as_str().starts_with("worker-"));
        assert_ne!(a, WorkerId::generate());
    }
}
