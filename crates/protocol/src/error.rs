use thiserror::Error;

use tessera_core::WorkerId;

/// Errors that can occur moving messages or data between components.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    #[error("worker {0} is unreachable")]
    Unreachable(WorkerId),

    #[error("scheduler channel closed")]
    SchedulerClosed,

    #[error("worker {worker} rejected data: {reason}")]
    Rejected { worker: WorkerId, reason: String },
}
