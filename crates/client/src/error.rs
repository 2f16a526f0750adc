use std::time::Duration;

use thiserror::Error;

use tessera_core::{FailureKind, GraphError, TaskFailure, TaskKey};
use tessera_protocol::TransportError;

/// Everything a client call can fail with.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid graph: {0}")]
    Graph(#[from] GraphError),

    /// The task, or one of its dependencies, raised or timed out.
    #[error("{0}")]
    Task(TaskFailure),

    #[error("lost data: {0}")]
    LostData(TaskFailure),

    #[error("suspicious task: {0}")]
    SuspiciousTask(TaskFailure),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("key {0} was cancelled")]
    Cancelled(TaskKey),

    #[error("scheduler is gone")]
    SchedulerClosed,

    #[error("no workers available")]
    NoWorkers,

    #[error("result of {key} could not be decoded: {source}")]
    Decode {
        key: TaskKey,
        #[source]
        source: rmp_serde::decode::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ClientError {
    /// Surface a task failure as the matching error variant.
    pub fn from_failure(failure: TaskFailure) -> Self {
        match failure.kind {
            FailureKind::LostData => Self::LostData(failure),
            FailureKind::SuspiciousTask => Self::SuspiciousTask(failure),
            FailureKind::Cancelled => Self::Cancelled(failure.key),
            FailureKind::TaskError | FailureKind::Timeout => Self::Task(failure),
        }
    }

    /// The task failure behind this error, if there is one.
    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            Self::Task(f) | Self::LostData(f) | Self::SuspiciousTask(f) => Some(f),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kinds_map_to_variants() {
        let raised = TaskFailure::raised("k".into(), "ValueError", "boom", "");
        let err = ClientError::from_failure(raised.clone());
        assert_eq!(err.to_string(), "ValueError: boom (task k)");
        assert_eq!(err.failure(), Some(&raised));

        let lost = ClientError::from_failure(TaskFailure::lost_data("x".into()));
        assert!(matches!(lost, ClientError::LostData(_)));

        let sus = ClientError::from_failure(TaskFailure::suspicious("x".into(), 3));
        assert!(matches!(sus, ClientError::SuspiciousTask(_)));

        let timeout = ClientError::from_failure(TaskFailure::timeout("x".into(), 10));
        assert_eq!(timeout.failure().unwrap().kind, FailureKind::Timeout);

        let cancelled = ClientError::from_failure(TaskFailure::cancelled("x".into()));
        assert!(matches!(cancelled, ClientError::Cancelled(k) if k.as_str() == "x"));
    }
}
