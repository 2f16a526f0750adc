use std::fmt;
use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;

use tessera_core::{Blob, TaskFailure, TaskKey, TaskState};
use tessera_protocol::KeyOutcome;

use crate::client::ClientInner;
use crate::error::ClientError;

/// Handle to a task result that may not exist yet.
///
/// Every live handle keeps its key wanted on the scheduler. Clones share
/// the hold; when the last one drops, the client releases the key. The
/// value itself is never cached here: each read goes to a worker.
pub struct TaskFuture {
    key: TaskKey,
    generation: u64,
    client: Weak<ClientInner>,
}

impl TaskFuture {
    pub(crate) fn new(key: TaskKey, generation: u64, client: &Arc<ClientInner>) -> Self {
        Self {
            key,
            generation,
            client: Arc::downgrade(client),
        }
    }

    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    fn client(&self) -> Result<Arc<ClientInner>, ClientError> {
        self.client.upgrade().ok_or(ClientError::SchedulerClosed)
    }

    /// The client, provided this handle was not cancelled or wiped by a
    /// restart in the meantime.
    fn live_client(&self) -> Result<Arc<ClientInner>, ClientError> {
        let client = self.client()?;
        if !client.is_live(&self.key, self.generation) {
            return Err(ClientError::Cancelled(self.key.clone()));
        }
        Ok(client)
    }

    /// Wait for the task and decode its value.
    pub async fn result<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        let blob = self.result_blob().await?;
        blob.decode().map_err(|source| ClientError::Decode {
            key: self.key.clone(),
            source,
        })
    }

    /// Wait for the task and return its encoded value.
    pub async fn result_blob(&self) -> Result<Blob, ClientError> {
        self.live_client()?.fetch(&self.key).await
    }

    /// Wait until the task finished, erred, or was forgotten.
    pub async fn outcome(&self) -> Result<KeyOutcome, ClientError> {
        match self.live_client() {
            Ok(client) => client.wait_key(&self.key).await,
            Err(ClientError::Cancelled(_)) => Ok(KeyOutcome::Forgotten),
            Err(e) => Err(e),
        }
    }

    /// Wait for the task and return its failure, if it failed.
    pub async fn exception(&self) -> Result<Option<TaskFailure>, ClientError> {
        Ok(match self.outcome().await? {
            KeyOutcome::Error(failure) => Some(failure),
            _ => None,
        })
    }

    /// Current scheduler-side state, without waiting.
    pub async fn state(&self) -> Result<Option<TaskState>, ClientError> {
        self.client()?.key_state(&self.key).await
    }

    /// Whether the task finished or failed, without waiting.
    pub async fn done(&self) -> Result<bool, ClientError> {
        Ok(self.state().await?.map_or(true, TaskState::is_finished))
    }

    /// Give up this handle now instead of at end of scope.
    pub fn release(self) {}
}

impl Clone for TaskFuture {
    fn clone(&self) -> Self {
        if let Some(client) = self.client.upgrade() {
            client.retain(&self.key, self.generation);
        }
        Self {
            key: self.key.clone(),
            generation: self.generation,
            client: self.client.clone(),
        }
    }
}

impl Drop for TaskFuture {
    fn drop(&mut self) {
        if let Some(client) = self.client.upgrade() {
            client.release(&self.key, self.generation);
        }
    }
}

impl fmt::Debug for TaskFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture").field("key", &self.key).finish()
    }
}

impl PartialEq for TaskFuture {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for TaskFuture {}
