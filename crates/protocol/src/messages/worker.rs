use serde::{Deserialize, Serialize};

use tessera_core::{TaskFailure, TaskKey, WorkerId};

use crate::message::Message;

/// Worker → scheduler status traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum WorkerMessage {
    Register {
        worker: WorkerId,
        ncores: usize,
        memory_limit: u64,
    },
    TaskFinished {
        worker: WorkerId,
        key: TaskKey,
        /// Wall-clock execution time in milliseconds.
        duration_ms: f64,
        nbytes: u64,
        type_tag: String,
    },
    TaskErred {
        worker: WorkerId,
        key: TaskKey,
        failure: TaskFailure,
    },
    Heartbeat {
        worker: WorkerId,
        memory_used: u64,
        spilled_bytes: u64,
        executing: Vec<TaskKey>,
    },
    /// The worker now also holds these keys (fetched replicas).
    AddKeys {
        worker: WorkerId,
        keys: Vec<(TaskKey, u64)>,
    },
    /// No listed holder could serve `missing`, a dependency of `key`.
    MissingData {
        worker: WorkerId,
        key: TaskKey,
        missing: TaskKey,
        holders: Vec<WorkerId>,
    },
    StealResponse {
        worker: WorkerId,
        key: TaskKey,
        stolen: bool,
    },
    Paused {
        worker: WorkerId,
    },
    Unpaused {
        worker: WorkerId,
    },
    KeysReleased {
        worker: WorkerId,
        keys: Vec<TaskKey>,
    },
    Unregister {
        worker: WorkerId,
        reason: String,
    },
}

impl WorkerMessage {
    pub fn op(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::TaskFinished { .. } => "task-finished",
            Self::TaskErred { .. } => "task-erred",
            Self::Heartbeat { .. } => "heartbeat",
            Self::AddKeys { .. } => "add-keys",
            Self::MissingData { .. } => "missing-data",
            Self::StealResponse { .. } => "steal-response",
            Self::Paused { .. } => "paused",
            Self::Unpaused { .. } => "unpaused",
            Self::KeysReleased { .. } => "keys-released",
            Self::Unregister { .. } => "unregister",
        }
    }

    pub fn worker(&self) -> &WorkerId {
        match self {
            Self::Register { worker, .. }
            | Self::TaskFinished { worker, .. }
            | Self::TaskErred { worker, .. }
            | Self::Heartbeat { worker, .. }
            | Self::AddKeys { worker, .. }
            | Self::MissingData { worker, .. }
            | Self::StealResponse { worker, .. }
            | Self::Paused { worker }
            | Self::Unpaused { worker }
            | Self::KeysReleased { worker, .. }
            | Self::Unregister { worker, .. } => worker,
        }
    }

    pub fn to_message(&self) -> Result<Message, rmp_serde::encode::Error> {
        Message::new(self.op(), self)
    }

    pub fn from_message(msg: &Message) -> Result<Self, rmp_serde::decode::Error> {
        msg.decode()
    }
}
