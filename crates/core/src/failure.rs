use std::fmt;

use serde::{Deserialize, Serialize};

use crate::key::TaskKey;

/// Why a task ended in the `error` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// The user function returned an error.
    TaskError,
    /// The only copy of a result without a recipe was lost with its worker.
    LostData,
    /// The task took down too many workers and is blacklisted.
    SuspiciousTask,
    /// The task exceeded the configured deadline.
    Timeout,
    /// The key was forgotten while someone was waiting on it.
    Cancelled,
}

impl FailureKind {
    /// Terminal failures are never retried.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::LostData | Self::SuspiciousTask)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskError => "task-error",
            Self::LostData => "lost-data",
            Self::SuspiciousTask => "suspicious-task",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A task error carried through the normal result channel.
///
/// Dependents of a failed task carry the same failure, with `key` still
/// naming the task that originally failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    /// The task the failure originated from.
    pub key: TaskKey,
    /// Exception type name, e.g. `ValueError`.
    pub exception: String,
    pub message: String,
    pub traceback: String,
}

impl TaskFailure {
    pub fn raised(
        key: TaskKey,
        exception: impl Into<String>,
        message: impl Into<String>,
        traceback: impl Into<String>,
    ) -> Self {
        Self {
            kind: FailureKind::TaskError,
            key,
            exception: exception.into(),
            message: message.into(),
            traceback: traceback.into(),
        }
    }

    pub fn lost_data(key: TaskKey) -> Self {
        Self {
            message: format!("all copies of {key} were lost and it has no recipe"),
            kind: FailureKind::LostData,
            exception: "LostDataError".into(),
            key,
            traceback: String::new(),
        }
    }

    pub fn suspicious(key: TaskKey, crashes: u32) -> Self {
        Self {
            message: format!("{key} was processing on {crashes} workers that died"),
            kind: FailureKind::SuspiciousTask,
            exception: "SuspiciousTaskError".into(),
            key,
            traceback: String::new(),
        }
    }

    pub fn timeout(key: TaskKey, limit_ms: u64) -> Self {
        Self {
            message: format!("{key} exceeded its deadline of {limit_ms}ms"),
            kind: FailureKind::Timeout,
            exception: "TimeoutError".into(),
            key,
            traceback: String::new(),
        }
    }

    pub fn cancelled(key: TaskKey) -> Self {
        Self {
            message: format!("{key} was released before it finished"),
            kind: FailureKind::Cancelled,
            exception: "CancelledError".into(),
            key,
            traceback: String::new(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (task {})", self.exception, self.message, self.key)
    }
}

impl std::error::Error for TaskFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_exception_and_blame() {
        let f = TaskFailure::raised("f-1".into(), "ValueError", "boom", "");
        assert_eq!(f.to_string(), "ValueError: boom (task f-1)");
        assert_eq!(f.kind, FailureKind::TaskError);
    }

    #[test]
    fn terminal_kinds() {
        assert!(FailureKind::LostData.is_terminal());
        assert!(FailureKind::SuspiciousTask.is_terminal());
        assert!(!FailureKind::TaskError.is_terminal());
        assert!(!FailureKind::Timeout.is_terminal());
    }

    #[test]
    fn kind_serializes_kebab_case() {
        let json = serde_json::to_string(&FailureKind::SuspiciousTask).unwrap();
        assert_eq!(json, "\"suspicious-task\"");
    }
}
