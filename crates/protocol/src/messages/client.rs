use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tokio::sync::oneshot;

use tessera_core::{
    AdaptiveConfig, ClientId, GraphError, TaskFailure, TaskKey, TaskSpec, TaskState, WorkerId,
};

/// Client → scheduler requests. Requests that need an answer carry a
/// oneshot reply channel.
#[derive(Debug)]
pub enum ClientRequest {
    /// Add tasks to the graph. `wanted` are the keys the client now holds
    /// futures for.
    UpdateGraph {
        client: ClientId,
        tasks: Vec<(TaskKey, TaskSpec)>,
        wanted: Vec<TaskKey>,
        reply: oneshot::Sender<Result<(), GraphError>>,
    },
    ReleaseKeys {
        client: ClientId,
        keys: Vec<TaskKey>,
    },
    /// Release the client's reference and forget tasks nobody else needs.
    Cancel {
        client: ClientId,
        keys: Vec<TaskKey>,
    },
    /// Resolve once `key` is in memory, erred or forgotten.
    WaitKey {
        key: TaskKey,
        reply: oneshot::Sender<KeyOutcome>,
    },
    WhoHas {
        keys: Vec<TaskKey>,
        reply: oneshot::Sender<BTreeMap<TaskKey, BTreeSet<WorkerId>>>,
    },
    HasWhat {
        reply: oneshot::Sender<BTreeMap<WorkerId, BTreeSet<TaskKey>>>,
    },
    KeyState {
        key: TaskKey,
        reply: oneshot::Sender<Option<TaskState>>,
    },
    /// Pick destination workers for `count` scattered values.
    ScatterTargets {
        count: usize,
        broadcast: bool,
        reply: oneshot::Sender<Vec<Vec<WorkerId>>>,
    },
    /// Record values the client pushed straight into worker stores.
    UpdateData {
        client: ClientId,
        keys: Vec<ScatteredKey>,
        reply: oneshot::Sender<()>,
    },
    /// The client could not fetch `key` from `worker`.
    MissingData {
        key: TaskKey,
        worker: WorkerId,
    },
    /// Forget every task and restart every worker. Replies with the number
    /// of workers told to restart.
    Restart {
        reply: oneshot::Sender<usize>,
    },
    Identity {
        reply: oneshot::Sender<ClusterInfo>,
    },
    DesiredWorkers {
        adaptive: AdaptiveConfig,
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Terminal answer to a [`ClientRequest::WaitKey`].
#[derive(Debug, Clone, PartialEq)]
pub enum KeyOutcome {
    Memory {
        who_has: Vec<WorkerId>,
        nbytes: u64,
        type_tag: String,
    },
    Error(TaskFailure),
    /// The key was cancelled, released or wiped by a restart.
    Forgotten,
}

/// A scattered value and the workers it was written to.
#[derive(Debug, Clone, PartialEq)]
pub struct ScatteredKey {
    pub key: TaskKey,
    pub nbytes: u64,
    pub type_tag: String,
    pub workers: Vec<WorkerId>,
}

/// Snapshot of one worker as the scheduler sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub ncores: usize,
    pub memory_limit: u64,
    pub memory_used: u64,
    pub spilled_bytes: u64,
    pub processing: usize,
    pub keys: usize,
    pub paused: bool,
}

/// Cluster status snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusterInfo {
    pub workers: Vec<WorkerInfo>,
    pub tasks: usize,
    pub unrunnable: usize,
}

impl ClusterInfo {
    pub fn ncores(&self) -> BTreeMap<WorkerId, usize> {
        self.workers.iter().map(|w| (w.id.clone(), w.ncores)).collect()
    }

    pub fn total_cores(&self) -> usize {
        self.workers.iter().map(|w| w.ncores).sum()
    }
}
