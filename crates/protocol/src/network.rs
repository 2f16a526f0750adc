use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use tessera_core::{Blob, TaskKey, WorkerId};

use crate::error::TransportError;
use crate::message::Message;
use crate::messages::data::{DataRequest, DataResponse};
use crate::messages::scheduler::SchedulerMessage;
use crate::messages::worker::WorkerMessage;
use crate::messages::SchedulerEvent;
use crate::traits::DataPlane;

/// Sending half of the scheduler's event queue.
pub type SchedulerInbox = mpsc::UnboundedSender<SchedulerEvent>;

/// Sending halves of one worker's channels.
#[derive(Debug, Clone)]
pub struct WorkerEndpoint {
    control: mpsc::UnboundedSender<Message>,
    data: mpsc::UnboundedSender<DataRequest>,
}

impl WorkerEndpoint {
    fn is_closed(&self) -> bool {
        self.control.is_closed() || self.data.is_closed()
    }
}

/// Receiving halves handed to a worker when it binds.
#[derive(Debug)]
pub struct WorkerMailbox {
    pub control: mpsc::UnboundedReceiver<Message>,
    pub data: mpsc::UnboundedReceiver<DataRequest>,
}

/// In-process routing between the scheduler and its workers.
///
/// A worker is reachable while it is bound and its mailbox is alive. When a
/// worker task dies its receivers drop and every send to it fails, which is
/// how crashes become visible to the rest of the cluster.
#[derive(Debug)]
pub struct LocalNetwork {
    scheduler: SchedulerInbox,
    workers: RwLock<HashMap<WorkerId, WorkerEndpoint>>,
}

impl LocalNetwork {
    pub fn new(scheduler: SchedulerInbox) -> Self {
        Self {
            scheduler,
            workers: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<WorkerId, WorkerEndpoint>> {
        self.workers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<WorkerId, WorkerEndpoint>> {
        self.workers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a worker address and return its mailbox.
    pub fn bind_worker(&self, worker: &WorkerId) -> WorkerMailbox {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        self.write().insert(
            worker.clone(),
            WorkerEndpoint {
                control: control_tx,
                data: data_tx,
            },
        );
        debug!(worker = %worker, "worker bound");
        WorkerMailbox {
            control: control_rx,
            data: data_rx,
        }
    }

    pub fn unbind_worker(&self, worker: &WorkerId) {
        if self.write().remove(worker).is_some() {
            debug!(worker = %worker, "worker unbound");
        }
    }

    pub fn is_reachable(&self, worker: &WorkerId) -> bool {
        self.read().get(worker).is_some_and(|ep| !ep.is_closed())
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.read().keys().cloned().collect()
    }

    /// A fresh handle on the scheduler's event queue.
    pub fn scheduler(&self) -> SchedulerInbox {
        self.scheduler.clone()
    }

    fn endpoint(&self, worker: &WorkerId) -> Result<WorkerEndpoint, TransportError> {
        self.read()
            .get(worker)
            .cloned()
            .ok_or_else(|| TransportError::UnknownWorker(worker.clone()))
    }

    pub fn send_to_worker(
        &self,
        worker: &WorkerId,
        msg: &SchedulerMessage,
    ) -> Result<(), TransportError> {
        let envelope = msg.to_message()?;
        self.endpoint(worker)?
            .control
            .send(envelope)
            .map_err(|_| TransportError::Unreachable(worker.clone()))
    }

    pub fn send_to_scheduler(&self, msg: &WorkerMessage) -> Result<(), TransportError> {
        let envelope = msg.to_message()?;
        self.scheduler
            .send(SchedulerEvent::Worker(envelope))
            .map_err(|_| TransportError::SchedulerClosed)
    }
}

#[async_trait]
impl DataPlane for LocalNetwork {
    async fn get_data(
        &self,
        worker: &WorkerId,
        keys: Vec<TaskKey>,
    ) -> Result<DataResponse, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.endpoint(worker)?
            .data
            .send(DataRequest::Get { keys, reply })
            .map_err(|_| TransportError::Unreachable(worker.clone()))?;
        rx.await
            .map_err(|_| TransportError::Unreachable(worker.clone()))
    }

    async fn put_data(
        &self,
        worker: &WorkerId,
        entries: Vec<(TaskKey, Blob)>,
    ) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.endpoint(worker)?
            .data
            .send(DataRequest::Put { entries, reply })
            .map_err(|_| TransportError::Unreachable(worker.clone()))?;
        rx.await
            .map_err(|_| TransportError::Unreachable(worker.clone()))?
            .map_err(|reason| TransportError::Rejected {
                worker: worker.clone(),
                reason,
            })
    }
}
