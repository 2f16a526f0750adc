use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::future::try_join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use tessera_core::{
    Blob, Call, ClientId, GraphError, TaskGraph, TaskKey, TaskSpec, TaskState, WorkerId,
};
use tessera_protocol::{
    ClientRequest, ClusterInfo, DataPlane, KeyOutcome, LocalNetwork, ScatteredKey,
    SchedulerEvent, SchedulerInbox,
};

use crate::error::ClientError;
use crate::future::TaskFuture;
use crate::refs::RefTable;

/// How often [`Client::wait_for_workers`] polls the scheduler.
const WORKER_POLL: Duration = Duration::from_millis(20);

/// How long [`Client::restart`] waits for replacement workers.
const RESTART_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection state shared by a client and all of its futures.
pub(crate) struct ClientInner {
    id: ClientId,
    network: Arc<LocalNetwork>,
    scheduler: SchedulerInbox,
    refs: Mutex<RefTable>,
}

impl ClientInner {
    fn refs(&self) -> MutexGuard<'_, RefTable> {
        self.refs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn retain(&self, key: &TaskKey, generation: u64) {
        self.refs().retain(key, generation);
    }

    pub(crate) fn is_live(&self, key: &TaskKey, generation: u64) -> bool {
        self.refs().is_live(key, generation)
    }

    /// Drop one reference; the scheduler hears about it on the last one.
    pub(crate) fn release(&self, key: &TaskKey, generation: u64) {
        if self.refs().release(key, generation) {
            debug!(client = %self.id, key = %key, "releasing key");
            let _ = self.notify(ClientRequest::ReleaseKeys {
                client: self.id,
                keys: vec![key.clone()],
            });
        }
    }

    fn notify(&self, request: ClientRequest) -> Result<(), ClientError> {
        self.scheduler
            .send(SchedulerEvent::Client(request))
            .map_err(|_| ClientError::SchedulerClosed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ClientRequest,
    ) -> Result<T, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.notify(build(reply))?;
        rx.await.map_err(|_| ClientError::SchedulerClosed)
    }

    pub(crate) async fn wait_key(&self, key: &TaskKey) -> Result<KeyOutcome, ClientError> {
        let key = key.clone();
        self.request(|reply| ClientRequest::WaitKey { key, reply })
            .await
    }

    pub(crate) async fn key_state(&self, key: &TaskKey) -> Result<Option<TaskState>, ClientError> {
        let key = key.clone();
        self.request(|reply| ClientRequest::KeyState { key, reply })
            .await
    }

    /// Wait for `key` and read it from one of its holders.
    ///
    /// A holder that cannot serve the key is reported to the scheduler,
    /// which either points us at another replica or recomputes the value.
    pub(crate) async fn fetch(&self, key: &TaskKey) -> Result<Blob, ClientError> {
        loop {
            let who_has = match self.wait_key(key).await? {
                KeyOutcome::Memory { who_has, .. } => who_has,
                KeyOutcome::Error(failure) => return Err(ClientError::from_failure(failure)),
                KeyOutcome::Forgotten => return Err(ClientError::Cancelled(key.clone())),
            };
            for worker in who_has {
                match self.network.get_data(&worker, vec![key.clone()]).await {
                    Ok(mut response) => {
                        if let Some(blob) = response.data.remove(key) {
                            return Ok(blob);
                        }
                        debug!(key = %key, worker = %worker, "holder no longer has key");
                    }
                    Err(e) => debug!(key = %key, worker = %worker, error = %e, "gather failed"),
                }
                self.notify(ClientRequest::MissingData {
                    key: key.clone(),
                    worker,
                })?;
            }
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let keys = self.refs().keys();
        if !keys.is_empty() {
            let _ = self.notify(ClientRequest::ReleaseKeys {
                client: self.id,
                keys,
            });
        }
    }
}

/// User-facing handle on a cluster.
///
/// Cloning is cheap and clones share one identity: futures created through
/// any clone count toward the same holds on the scheduler.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect to the scheduler behind `network`.
    pub fn new(network: Arc<LocalNetwork>) -> Self {
        let id = ClientId::generate();
        info!(client = %id, "client connected");
        Self {
            inner: Arc::new(ClientInner {
                id,
                scheduler: network.scheduler(),
                network,
                refs: Mutex::new(RefTable::new()),
            }),
        }
    }

    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    /// Take a reference on each key, in order.
    fn hold(&self, keys: &[TaskKey]) -> Vec<TaskFuture> {
        let mut refs = self.inner.refs();
        keys.iter()
            .map(|key| TaskFuture::new(key.clone(), refs.acquire(key), &self.inner))
            .collect()
    }

    fn hold_one(&self, key: &TaskKey) -> TaskFuture {
        let generation = self.inner.refs().acquire(key);
        TaskFuture::new(key.clone(), generation, &self.inner)
    }

    /// Keys among `keys` this client holds no future for yet.
    fn unheld<'a>(&self, keys: impl IntoIterator<Item = &'a TaskKey>) -> BTreeSet<TaskKey> {
        let refs = self.inner.refs();
        keys.into_iter()
            .filter(|k| !refs.contains(k))
            .cloned()
            .collect()
    }

    /// Validate new tasks locally, then hand them to the scheduler.
    ///
    /// Only tasks in `fresh` are sent; the rest are already backed by a
    /// live future. Every dependency must be part of the update or held by
    /// this client.
    async fn update_graph(
        &self,
        tasks: Vec<(TaskKey, TaskSpec)>,
        fresh: &BTreeSet<TaskKey>,
        wanted: Vec<TaskKey>,
    ) -> Result<(), ClientError> {
        let mut graph = TaskGraph::new();
        for (key, spec) in tasks {
            if fresh.contains(&key) {
                graph.insert(key, spec)?;
            }
        }
        {
            let refs = self.inner.refs();
            if let Some(dependency) = graph
                .external_dependencies()
                .into_iter()
                .find(|dep| !refs.contains(dep))
            {
                let task = graph
                    .keys()
                    .find(|k| {
                        graph
                            .get(k)
                            .is_some_and(|s| s.dependencies().contains(&dependency))
                    })
                    .cloned()
                    .unwrap_or_else(|| dependency.clone());
                return Err(GraphError::UnknownDependency { task, dependency }.into());
            }
        }
        let tasks = graph.into_ordered_tasks()?;

        let client = self.inner.id;
        self.inner
            .request(|reply| ClientRequest::UpdateGraph {
                client,
                tasks,
                wanted,
                reply,
            })
            .await??;
        Ok(())
    }

    /// Submit one call and return a future for its result.
    pub async fn submit(&self, call: Call) -> Result<TaskFuture, ClientError> {
        let (key, spec) = call.build()?;
        let fresh = self.unheld([&key]);
        let future = self.hold_one(&key);
        self.update_graph(vec![(key.clone(), spec)], &fresh, vec![key])
            .await?;
        Ok(future)
    }

    /// Submit `function` once per item. Equal items share a key when `pure`.
    pub async fn map<T: Serialize>(
        &self,
        function: &str,
        items: impl IntoIterator<Item = T>,
        pure: bool,
    ) -> Result<Vec<TaskFuture>, ClientError> {
        let mut tasks = Vec::new();
        for item in items {
            tasks.push(Call::new(function).arg(&item).pure(pure).build()?);
        }
        let keys: Vec<TaskKey> = tasks.iter().map(|(k, _)| k.clone()).collect();
        let fresh = self.unheld(&keys);
        let futures = self.hold(&keys);
        self.update_graph(tasks, &fresh, keys).await?;
        Ok(futures)
    }

    /// Submit every task in `graph` and return a future for each of them.
    pub async fn persist(
        &self,
        graph: &TaskGraph,
    ) -> Result<BTreeMap<TaskKey, TaskFuture>, ClientError> {
        let tasks = graph.clone().into_ordered_tasks()?;
        let keys: Vec<TaskKey> = tasks.iter().map(|(k, _)| k.clone()).collect();
        let fresh = self.unheld(&keys);
        let futures = self.hold(&keys);
        self.update_graph(tasks, &fresh, keys).await?;
        Ok(futures
            .into_iter()
            .map(|f| (f.key().clone(), f))
            .collect())
    }

    /// Run `graph` and return the values of its outputs.
    ///
    /// Intermediate results are released as soon as nothing reads them.
    pub async fn compute<T: DeserializeOwned>(
        &self,
        graph: &TaskGraph,
    ) -> Result<BTreeMap<TaskKey, T>, ClientError> {
        let tasks = graph.clone().into_ordered_tasks()?;
        let fresh = self.unheld(graph.keys());
        let outputs = graph.outputs();
        let futures = self.hold(&outputs);
        self.update_graph(tasks, &fresh, outputs).await?;
        let values: Vec<T> = self.gather(&futures).await?;
        Ok(futures
            .iter()
            .map(|f| f.key().clone())
            .zip(values)
            .collect())
    }

    /// Wait for all futures and decode their values, in order.
    ///
    /// The first failure is returned as-is. Results come straight from the
    /// workers that hold them.
    pub async fn gather<T: DeserializeOwned>(
        &self,
        futures: &[TaskFuture],
    ) -> Result<Vec<T>, ClientError> {
        try_join_all(futures.iter().map(|f| f.result::<T>())).await
    }

    pub async fn gather_blobs(&self, futures: &[TaskFuture]) -> Result<Vec<Blob>, ClientError> {
        try_join_all(futures.iter().map(|f| f.result_blob())).await
    }

    /// Place local values on workers and return futures that already hold
    /// them. With `broadcast` every running worker gets a copy.
    pub async fn scatter<T: Serialize>(
        &self,
        items: &[T],
        broadcast: bool,
    ) -> Result<Vec<TaskFuture>, ClientError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let blobs = items
            .iter()
            .map(|item| {
                Blob::encode(item).map_err(|source| GraphError::Serialization {
                    function: "scatter".to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let keys: Vec<TaskKey> = blobs.iter().map(scatter_key).collect();

        let count = blobs.len();
        let targets = self
            .inner
            .request(|reply| ClientRequest::ScatterTargets {
                count,
                broadcast,
                reply,
            })
            .await?;
        if targets.len() != count || targets.iter().any(Vec::is_empty) {
            return Err(ClientError::NoWorkers);
        }

        let mut per_worker: BTreeMap<WorkerId, Vec<(TaskKey, Blob)>> = BTreeMap::new();
        for ((key, blob), workers) in keys.iter().zip(&blobs).zip(&targets) {
            for worker in workers {
                per_worker
                    .entry(worker.clone())
                    .or_default()
                    .push((key.clone(), blob.clone()));
            }
        }
        let network = &self.inner.network;
        try_join_all(
            per_worker
                .into_iter()
                .map(|(worker, entries)| async move { network.put_data(&worker, entries).await }),
        )
        .await?;

        let futures = self.hold(&keys);
        let scattered = keys
            .into_iter()
            .zip(blobs)
            .zip(targets)
            .map(|((key, blob), workers)| ScatteredKey {
                key,
                nbytes: blob.nbytes(),
                type_tag: blob.type_tag,
                workers,
            })
            .collect();
        let client = self.inner.id;
        self.inner
            .request(|reply| ClientRequest::UpdateData {
                client,
                keys: scattered,
                reply,
            })
            .await?;
        debug!(client = %client, count, broadcast, "scattered");
        Ok(futures)
    }

    /// Stop caring about these futures' keys.
    ///
    /// Work nobody else wants is forgotten; waiters on it see
    /// [`ClientError::Cancelled`]. Existing handles become inert.
    pub fn cancel(&self, futures: &[TaskFuture]) -> Result<(), ClientError> {
        let keys: Vec<TaskKey> = futures
            .iter()
            .map(|f| f.key().clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        {
            let mut refs = self.inner.refs();
            for key in &keys {
                refs.forget(key);
            }
        }
        info!(client = %self.inner.id, keys = keys.len(), "cancelling");
        self.inner.notify(ClientRequest::Cancel {
            client: self.inner.id,
            keys,
        })
    }

    /// Forget every task and replace every worker.
    ///
    /// Returns once as many workers as were running have registered again.
    /// Every outstanding future resolves as cancelled.
    pub async fn restart(&self) -> Result<usize, ClientError> {
        self.inner.refs().clear();
        let workers = self
            .inner
            .request(|reply| ClientRequest::Restart { reply })
            .await?;
        info!(client = %self.inner.id, workers, "cluster restarting");
        self.wait_for_workers(workers, RESTART_TIMEOUT).await?;
        Ok(workers)
    }

    /// Poll until at least `n` workers are registered.
    pub async fn wait_for_workers(&self, n: usize, timeout: Duration) -> Result<(), ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.identity().await?.workers.len() >= n {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(client = %self.inner.id, wanted = n, "workers did not show up");
                return Err(ClientError::Timeout(timeout));
            }
            tokio::time::sleep(WORKER_POLL).await;
        }
    }

    /// Where each key's data currently lives.
    pub async fn who_has(
        &self,
        futures: &[TaskFuture],
    ) -> Result<BTreeMap<TaskKey, BTreeSet<WorkerId>>, ClientError> {
        let keys = futures.iter().map(|f| f.key().clone()).collect();
        self.inner
            .request(|reply| ClientRequest::WhoHas { keys, reply })
            .await
    }

    /// Which keys each worker currently holds.
    pub async fn has_what(&self) -> Result<BTreeMap<WorkerId, BTreeSet<TaskKey>>, ClientError> {
        self.inner
            .request(|reply| ClientRequest::HasWhat { reply })
            .await
    }

    pub async fn key_state(&self, key: &TaskKey) -> Result<Option<TaskState>, ClientError> {
        self.inner.key_state(key).await
    }

    /// Thread count of every registered worker.
    pub async fn ncores(&self) -> Result<BTreeMap<WorkerId, usize>, ClientError> {
        Ok(self.identity().await?.ncores())
    }

    pub async fn identity(&self) -> Result<ClusterInfo, ClientError> {
        self.inner
            .request(|reply| ClientRequest::Identity { reply })
            .await
    }

    /// Number of live futures this client holds on `key`.
    pub fn ref_count(&self, key: &TaskKey) -> usize {
        self.inner.refs().count(key)
    }
}

/// Scattered values are keyed by content, so scattering the same value
/// twice yields the same key.
fn scatter_key(blob: &Blob) -> TaskKey {
    let outer = blob.type_tag.split('<').next().unwrap_or_default();
    let short = outer.rsplit("::").next().unwrap_or(outer);
    let prefix: String = short
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect();
    let prefix = if prefix.is_empty() { "data".to_string() } else { prefix };
    TaskKey::fingerprint(&prefix, &blob.bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scatter_keys_follow_content() {
        let a = Blob::encode(&vec![1u32, 2, 3]).unwrap();
        let b = Blob::encode(&vec![1u32, 2, 3]).unwrap();
        let c = Blob::encode(&vec![3u32, 2, 1]).unwrap();
        assert_eq!(scatter_key(&a), scatter_key(&b));
        assert_ne!(scatter_key(&a), scatter_key(&c));
        assert!(scatter_key(&a).as_str().starts_with("vec-"));
    }

    #[test]
    fn scatter_key_prefix_is_plain() {
        let key = scatter_key(&Blob::encode("hello").unwrap());
        assert!(key.as_str().starts_with("str-"), "{key}");
        let key = scatter_key(&Blob::encode(&(1u8, 2u8)).unwrap());
        assert!(key.as_str().starts_with("u8u8-"), "{key}");
    }
}
