use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use tessera_core::{
    Arg, Blob, FunctionRegistry, TaskFailure, TaskInputs, TaskKey, WorkerConfig, WorkerId,
};
use tessera_protocol::{
    ComputeRequest, DataPlane, DataRequest, DataResponse, LocalNetwork, Message,
    SchedulerMessage, WorkerMailbox, WorkerMessage,
};

use crate::error::WorkerError;
use crate::execution::{Execution, ExecutionPool, Outcome};
use crate::store::{DataStore, MemoryPressure};

/// Why a worker's event loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Closed for good.
    Closed,
    /// The scheduler asked for a fresh worker in this slot.
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for dependencies from peers.
    Fetching,
    /// Inputs are local; waiting for a free thread.
    Ready,
    Executing,
}

struct WorkerTask {
    request: ComputeRequest,
    phase: Phase,
    /// Drop the result instead of reporting it.
    cancelled: bool,
}

enum FetchOutcome {
    Fetched(Vec<(TaskKey, Blob)>),
    Missing {
        missing: TaskKey,
        holders: Vec<WorkerId>,
    },
}

struct Fetch {
    key: TaskKey,
    outcome: FetchOutcome,
}

/// One worker: a data store, an execution pool, and the event loop that
/// connects them to the scheduler and to peers.
pub struct Worker {
    id: WorkerId,
    config: WorkerConfig,
    registry: Arc<FunctionRegistry>,
    network: Arc<LocalNetwork>,
    mailbox: WorkerMailbox,
    store: DataStore,
    pool: ExecutionPool,
    executions: mpsc::UnboundedReceiver<Execution>,
    fetch_tx: mpsc::UnboundedSender<Fetch>,
    fetches: mpsc::UnboundedReceiver<Fetch>,
    tasks: HashMap<TaskKey, WorkerTask>,
    /// Ready tasks ordered by scheduler priority.
    ready: BTreeSet<(u64, TaskKey)>,
    executing: usize,
    paused: bool,
}

impl Worker {
    /// Create the worker and bind its address on `network`.
    pub fn new(
        id: WorkerId,
        config: WorkerConfig,
        registry: Arc<FunctionRegistry>,
        network: Arc<LocalNetwork>,
    ) -> Result<Self, WorkerError> {
        let store = DataStore::new(
            &config.spill_directory(id.as_str()),
            config.memory_limit,
            config.memory,
        )?;
        let (exec_tx, executions) = mpsc::unbounded_channel();
        let pool = ExecutionPool::new(config.resolved_nthreads(), id.as_str(), exec_tx)?;
        let (fetch_tx, fetches) = mpsc::unbounded_channel();
        let mailbox = network.bind_worker(&id);
        Ok(Self {
            id,
            config,
            registry,
            network,
            mailbox,
            store,
            pool,
            executions,
            fetch_tx,
            fetches,
            tasks: HashMap::new(),
            ready: BTreeSet::new(),
            executing: 0,
            paused: false,
        })
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Run until the scheduler closes the worker or something fatal
    /// happens. The address is unbound either way.
    pub async fn run(mut self) -> Result<WorkerExit, WorkerError> {
        let result = self.event_loop().await;
        match &result {
            Ok(exit) => {
                info!(worker = %self.id, ?exit, "worker stopped");
                self.report(WorkerMessage::Unregister {
                    worker: self.id.clone(),
                    reason: format!("{exit:?}").to_lowercase(),
                });
            }
            Err(e) => error!(worker = %self.id, error = %e, "worker failed"),
        }
        self.network.unbind_worker(&self.id);
        result
    }

    async fn event_loop(&mut self) -> Result<WorkerExit, WorkerError> {
        let nthreads = self.pool.threads();
        self.network.send_to_scheduler(&WorkerMessage::Register {
            worker: self.id.clone(),
            ncores: nthreads,
            memory_limit: self.store.limit(),
        })?;
        info!(
            worker = %self.id,
            nthreads,
            memory_limit = self.store.limit(),
            "worker started"
        );

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.mailbox.control.recv() => {
                    let Some(msg) = msg else {
                        return Ok(WorkerExit::Closed);
                    };
                    if let Some(exit) = self.handle_control(msg) {
                        return Ok(exit);
                    }
                }
                Some(request) = self.mailbox.data.recv() => self.handle_data(request),
                Some(done) = self.executions.recv() => self.execution_done(done)?,
                Some(fetch) = self.fetches.recv() => self.fetch_done(fetch),
                _ = heartbeat.tick() => self.heartbeat(),
            }
            self.check_memory()?;
            self.start_ready()?;
        }
    }

    fn report(&self, msg: WorkerMessage) {
        if let Err(e) = self.network.send_to_scheduler(&msg) {
            debug!(worker = %self.id, op = msg.op(), error = %e, "scheduler unreachable");
        }
    }

    // ── Scheduler instructions ──────────────────────────────────────

    fn handle_control(&mut self, envelope: Message) -> Option<WorkerExit> {
        let msg = match SchedulerMessage::from_message(&envelope) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(worker = %self.id, op = %envelope.op, error = %e, "undecodable scheduler message");
                return None;
            }
        };
        match msg {
            SchedulerMessage::Compute(request) => self.compute(request),
            SchedulerMessage::ReleaseKeys { keys } => self.release_keys(keys),
            SchedulerMessage::StealRequest { key } => self.steal_request(key),
            SchedulerMessage::Cancel { key } => self.cancel(&key),
            SchedulerMessage::Close { restart } => {
                info!(worker = %self.id, restart, "close requested");
                return Some(if restart {
                    WorkerExit::Restart
                } else {
                    WorkerExit::Closed
                });
            }
        }
        None
    }

    fn compute(&mut self, request: ComputeRequest) {
        let key = request.key.clone();
        if self.tasks.contains_key(&key) {
            debug!(worker = %self.id, key = %key, "duplicate compute ignored");
            return;
        }

        let missing: Vec<TaskKey> = dependencies(&request)
            .into_iter()
            .filter(|dep| !self.store.contains(dep))
            .collect();

        if missing.is_empty() {
            self.ready.insert((request.priority, key.clone()));
            self.tasks.insert(
                key,
                WorkerTask {
                    request,
                    phase: Phase::Ready,
                    cancelled: false,
                },
            );
            return;
        }

        debug!(worker = %self.id, key = %key, missing = missing.len(), "fetching dependencies");
        let network = Arc::clone(&self.network);
        let results = self.fetch_tx.clone();
        let me = self.id.clone();
        let who_has = request.who_has.clone();
        let fetch_key = key.clone();
        tokio::spawn(async move {
            let outcome = fetch_dependencies(&*network, &me, missing, &who_has).await;
            let _ = results.send(Fetch {
                key: fetch_key,
                outcome,
            });
        });
        self.tasks.insert(
            key,
            WorkerTask {
                request,
                phase: Phase::Fetching,
                cancelled: false,
            },
        );
    }

    fn release_keys(&mut self, keys: Vec<TaskKey>) {
        let mut dropped = 0usize;
        for key in &keys {
            if self.store.remove(key) {
                dropped += 1;
            }
        }
        debug!(worker = %self.id, requested = keys.len(), dropped, "keys released");
        self.report(WorkerMessage::KeysReleased {
            worker: self.id.clone(),
            keys,
        });
    }

    /// Give a task up unless it already started.
    fn steal_request(&mut self, key: TaskKey) {
        let stolen = self
            .tasks
            .get(&key)
            .is_some_and(|t| t.phase != Phase::Executing);
        if stolen {
            if let Some(task) = self.tasks.remove(&key) {
                self.ready.remove(&(task.request.priority, key.clone()));
            }
            debug!(worker = %self.id, key = %key, "task stolen");
        }
        self.report(WorkerMessage::StealResponse {
            worker: self.id.clone(),
            key,
            stolen,
        });
    }

    fn cancel(&mut self, key: &TaskKey) {
        let Some(task) = self.tasks.get_mut(key) else {
            return;
        };
        if task.phase == Phase::Executing {
            debug!(worker = %self.id, key = %key, "running task cancelled, result will be dropped");
            task.cancelled = true;
            return;
        }
        if let Some(task) = self.tasks.remove(key) {
            self.ready.remove(&(task.request.priority, key.clone()));
        }
        debug!(worker = %self.id, key = %key, "queued task cancelled");
    }

    // ── Data plane ──────────────────────────────────────────────────

    fn handle_data(&mut self, request: DataRequest) {
        match request {
            DataRequest::Get { keys, reply } => {
                let mut response = DataResponse::default();
                for key in keys {
                    match self.store.get(&key) {
                        Ok(Some(blob)) => {
                            response.data.insert(key, blob);
                        }
                        Ok(None) => response.missing.push(key),
                        Err(e) => {
                            warn!(worker = %self.id, key = %key, error = %e, "failed to read key");
                            response.missing.push(key);
                        }
                    }
                }
                let _ = reply.send(response);
            }
            DataRequest::Put { entries, reply } => {
                let count = entries.len();
                let mut result = Ok(());
                for (key, blob) in entries {
                    if let Err(e) = self.store.put(key, blob) {
                        result = Err(e.to_string());
                        break;
                    }
                }
                debug!(worker = %self.id, keys = count, "received scattered data");
                let _ = reply.send(result);
            }
        }
    }

    fn fetch_done(&mut self, fetch: Fetch) {
        let fetching = self
            .tasks
            .get(&fetch.key)
            .is_some_and(|t| t.phase == Phase::Fetching);
        if !fetching {
            // Stolen or cancelled while the transfer was in flight.
            return;
        }

        match fetch.outcome {
            FetchOutcome::Fetched(entries) => {
                let mut added = Vec::with_capacity(entries.len());
                for (dep, blob) in entries {
                    let nbytes = blob.nbytes();
                    if let Err(e) = self.store.put(dep.clone(), blob) {
                        warn!(worker = %self.id, key = %dep, error = %e, "failed to store fetched key");
                        continue;
                    }
                    added.push((dep, nbytes));
                }
                if !added.is_empty() {
                    self.report(WorkerMessage::AddKeys {
                        worker: self.id.clone(),
                        keys: added,
                    });
                }
                if let Some(task) = self.tasks.get_mut(&fetch.key) {
                    task.phase = Phase::Ready;
                    self.ready.insert((task.request.priority, fetch.key));
                }
            }
            FetchOutcome::Missing { missing, holders } => {
                warn!(
                    worker = %self.id,
                    key = %fetch.key,
                    missing = %missing,
                    holders = ?holders,
                    "dependency unavailable from every holder"
                );
                self.tasks.remove(&fetch.key);
                self.report(WorkerMessage::MissingData {
                    worker: self.id.clone(),
                    key: fetch.key,
                    missing,
                    holders,
                });
            }
        }
    }

    // ── Execution ───────────────────────────────────────────────────

    fn start_ready(&mut self) -> Result<(), WorkerError> {
        while !self.paused && self.executing < self.pool.threads() {
            let Some((_, key)) = self.ready.pop_first() else {
                break;
            };
            self.start(key);
            self.check_memory()?;
        }
        Ok(())
    }

    fn start(&mut self, key: TaskKey) {
        let Some(task) = self.tasks.get(&key) else {
            return;
        };
        let request = task.request.clone();

        let Some(function) = self.registry.get(&request.function) else {
            warn!(worker = %self.id, key = %key, function = %request.function, "unknown function");
            self.tasks.remove(&key);
            self.report(WorkerMessage::TaskErred {
                worker: self.id.clone(),
                failure: TaskFailure::raised(
                    key.clone(),
                    "UnknownFunctionError",
                    format!("function `{}` is not registered", request.function),
                    String::new(),
                ),
                key,
            });
            return;
        };

        let inputs = match self.gather_inputs(&request) {
            Ok(inputs) => inputs,
            Err(missing) => {
                warn!(worker = %self.id, key = %key, missing = %missing, "dependency vanished before execution");
                self.tasks.remove(&key);
                self.report(WorkerMessage::MissingData {
                    worker: self.id.clone(),
                    key,
                    missing,
                    holders: Vec::new(),
                });
                return;
            }
        };

        let reserved: u64 = inputs
            .args
            .iter()
            .chain(inputs.kwargs.values())
            .map(Blob::nbytes)
            .sum();
        if let Some(task) = self.tasks.get_mut(&key) {
            task.phase = Phase::Executing;
        }
        self.executing += 1;
        self.store.reserve(reserved);
        debug!(worker = %self.id, key = %key, function = %request.function, "executing");
        self.pool.spawn(key, function, inputs, reserved);
    }

    fn gather_inputs(&mut self, request: &ComputeRequest) -> Result<TaskInputs, TaskKey> {
        let mut inputs = TaskInputs::default();
        for arg in &request.args {
            inputs.args.push(self.resolve(arg)?);
        }
        for (name, arg) in &request.kwargs {
            inputs.kwargs.insert(name.clone(), self.resolve(arg)?);
        }
        Ok(inputs)
    }

    /// Literal value or local copy of a dependency.
    fn resolve(&mut self, arg: &Arg) -> Result<Blob, TaskKey> {
        match arg {
            Arg::Literal(blob) => Ok(blob.clone()),
            Arg::Key(dep) => match self.store.get(dep) {
                Ok(Some(blob)) => Ok(blob),
                Ok(None) => Err(dep.clone()),
                Err(e) => {
                    warn!(worker = %self.id, key = %dep, error = %e, "failed to read dependency");
                    Err(dep.clone())
                }
            },
        }
    }

    fn execution_done(&mut self, done: Execution) -> Result<(), WorkerError> {
        let Execution {
            key,
            outcome,
            duration,
            reserved,
        } = done;
        self.store.unreserve(reserved);
        self.executing = self.executing.saturating_sub(1);
        let task = self.tasks.remove(&key);
        let cancelled = task.as_ref().map_or(true, |t| t.cancelled);
        let function = task.map(|t| t.request.function).unwrap_or_default();

        match outcome {
            Outcome::Panicked(message) => return Err(WorkerError::TaskCrashed { key, message }),
            _ if cancelled => {
                debug!(worker = %self.id, key = %key, "result of cancelled task dropped");
            }
            Outcome::Finished(blob) => {
                let nbytes = blob.nbytes();
                let type_tag = blob.type_tag.clone();
                self.store.put(key.clone(), blob)?;
                self.report(WorkerMessage::TaskFinished {
                    worker: self.id.clone(),
                    key,
                    duration_ms: duration.as_secs_f64() * 1000.0,
                    nbytes,
                    type_tag,
                });
            }
            Outcome::Failed(e) => {
                debug!(worker = %self.id, key = %key, error = %e, "task raised");
                let traceback = format!("  in {function}() for task {key} on {}", self.id);
                self.report(WorkerMessage::TaskErred {
                    worker: self.id.clone(),
                    failure: TaskFailure::raised(key.clone(), e.exception, e.message, traceback),
                    key,
                });
            }
        }
        Ok(())
    }

    // ── Health ──────────────────────────────────────────────────────

    fn heartbeat(&self) {
        let executing = self
            .tasks
            .iter()
            .filter(|(_, t)| t.phase == Phase::Executing)
            .map(|(k, _)| k.clone())
            .collect();
        self.report(WorkerMessage::Heartbeat {
            worker: self.id.clone(),
            memory_used: self.store.used(),
            spilled_bytes: self.store.spilled_bytes(),
            executing,
        });
    }

    fn check_memory(&mut self) -> Result<(), WorkerError> {
        match self.store.pressure() {
            MemoryPressure::Terminate => {
                error!(
                    worker = %self.id,
                    used = self.store.used(),
                    limit = self.store.limit(),
                    "memory above terminate threshold, shutting down"
                );
                return Err(WorkerError::MemoryLimit {
                    used: self.store.used(),
                    limit: self.store.limit(),
                });
            }
            MemoryPressure::Pause if !self.paused => {
                warn!(
                    worker = %self.id,
                    used = self.store.used(),
                    limit = self.store.limit(),
                    "memory above pause threshold, pausing execution"
                );
                self.paused = true;
                self.report(WorkerMessage::Paused {
                    worker: self.id.clone(),
                });
            }
            MemoryPressure::Normal if self.paused => {
                info!(worker = %self.id, used = self.store.used(), "memory back to normal, resuming");
                self.paused = false;
                self.report(WorkerMessage::Unpaused {
                    worker: self.id.clone(),
                });
            }
            _ => {}
        }
        Ok(())
    }
}

fn dependencies(request: &ComputeRequest) -> BTreeSet<TaskKey> {
    request
        .args
        .iter()
        .chain(request.kwargs.values())
        .filter_map(Arg::as_key)
        .cloned()
        .collect()
}

/// Pull each missing dependency from the first holder that has it.
async fn fetch_dependencies<D: DataPlane + ?Sized>(
    plane: &D,
    me: &WorkerId,
    missing: Vec<TaskKey>,
    who_has: &BTreeMap<TaskKey, Vec<WorkerId>>,
) -> FetchOutcome {
    let mut fetched = Vec::with_capacity(missing.len());
    for dep in missing {
        let holders = who_has.get(&dep).cloned().unwrap_or_default();
        let mut found = None;
        for holder in holders.iter().filter(|h| *h != me) {
            match plane.get_data(holder, vec![dep.clone()]).await {
                Ok(mut response) => {
                    if let Some(blob) = response.data.remove(&dep) {
                        found = Some(blob);
                        break;
                    }
                    debug!(worker = %me, holder = %holder, key = %dep, "holder does not have key");
                }
                Err(e) => {
                    debug!(worker = %me, holder = %holder, key = %dep, error = %e, "fetch failed");
                }
            }
        }
        match found {
            Some(blob) => fetched.push((dep, blob)),
            None => {
                return FetchOutcome::Missing {
                    missing: dep,
                    holders,
                }
            }
        }
    }
    FetchOutcome::Fetched(fetched)
}
