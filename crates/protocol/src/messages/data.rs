use std::collections::BTreeMap;

use tokio::sync::oneshot;

use tessera_core::{Blob, TaskKey};

/// Direct key transfer served by a worker's data channel.
#[derive(Debug)]
pub enum DataRequest {
    /// A peer or client reads keys.
    Get {
        keys: Vec<TaskKey>,
        reply: oneshot::Sender<DataResponse>,
    },
    /// A client pushes scattered values.
    Put {
        entries: Vec<(TaskKey, Blob)>,
        reply: oneshot::Sender<Result<(), String>>,
    },
}

/// Answer to a [`DataRequest::Get`].
#[derive(Debug, Clone, Default)]
pub struct DataResponse {
    pub data: BTreeMap<TaskKey, Blob>,
    /// Requested keys the worker does not hold.
    pub missing: Vec<TaskKey>,
}
