use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use tessera_core::{SchedulerConfig, TaskKey, WorkerId};
use tessera_protocol::{
    ClientRequest, KeyOutcome, LocalNetwork, Message, SchedulerEvent, SchedulerMessage,
    WorkerMessage,
};

use crate::duration::DurationEstimator;
use crate::metrics::SchedulerMetrics;
use crate::records::{TaskRecord, WorkerRecord};

/// A steal request sent to `victim` that has not been answered yet.
#[derive(Debug, Clone)]
pub(crate) struct InFlightSteal {
    pub victim: WorkerId,
    pub thief: WorkerId,
}

/// All scheduler state. Owned by exactly one [`Scheduler`] task.
pub struct SchedulerState {
    pub(crate) config: SchedulerConfig,
    pub(crate) network: Arc<LocalNetwork>,
    pub(crate) tasks: HashMap<TaskKey, TaskRecord>,
    /// Workers in registration order.
    pub(crate) workers: IndexMap<WorkerId, WorkerRecord>,
    /// Ready tasks no running worker can take right now.
    pub(crate) unrunnable: BTreeSet<TaskKey>,
    /// Ready tasks awaiting placement.
    pub(crate) ready: VecDeque<TaskKey>,
    /// Workers found dead mid-event, removed on the next flush.
    pub(crate) lost_workers: Vec<(WorkerId, String)>,
    pub(crate) waiters: HashMap<TaskKey, Vec<oneshot::Sender<KeyOutcome>>>,
    pub(crate) steals: HashMap<TaskKey, InFlightSteal>,
    pub(crate) durations: DurationEstimator,
    pub(crate) metrics: Arc<RwLock<SchedulerMetrics>>,
    pub(crate) rebalance_requested: bool,
    next_priority: u64,
    next_worker_order: u64,
}

impl SchedulerState {
    pub fn new(config: SchedulerConfig, network: Arc<LocalNetwork>) -> Self {
        let durations =
            DurationEstimator::new(config.duration_smoothing, config.unknown_task_duration());
        Self {
            config,
            network,
            tasks: HashMap::new(),
            workers: IndexMap::new(),
            unrunnable: BTreeSet::new(),
            ready: VecDeque::new(),
            lost_workers: Vec::new(),
            waiters: HashMap::new(),
            steals: HashMap::new(),
            durations,
            metrics: Arc::new(RwLock::new(SchedulerMetrics::default())),
            rebalance_requested: false,
            next_priority: 0,
            next_worker_order: 0,
        }
    }

    pub fn task(&self, key: &TaskKey) -> Option<&TaskRecord> {
        self.tasks.get(key)
    }

    pub fn worker(&self, id: &WorkerId) -> Option<&WorkerRecord> {
        self.workers.get(id)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn next_priority(&mut self) -> u64 {
        let p = self.next_priority;
        self.next_priority += 1;
        p
    }

    pub(crate) fn with_metrics(&self, f: impl FnOnce(&mut SchedulerMetrics)) {
        let mut guard = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    /// Send to a worker. An unreachable worker is queued for removal.
    pub(crate) fn send(&mut self, worker: &WorkerId, msg: SchedulerMessage) -> bool {
        match self.network.send_to_worker(worker, &msg) {
            Ok(()) => true,
            Err(e) => {
                debug!(worker = %worker, op = msg.op(), error = %e, "send to worker failed");
                if self.workers.contains_key(worker)
                    && !self.lost_workers.iter().any(|(w, _)| w == worker)
                {
                    self.lost_workers.push((worker.clone(), e.to_string()));
                }
                false
            }
        }
    }

    /// Drain deferred work: lost workers first, then placement, then
    /// stealing if something asked for it.
    pub fn flush(&mut self) {
        loop {
            if let Some((worker, reason)) = self.lost_workers.pop() {
                self.remove_worker(&worker, &reason);
                continue;
            }
            if let Some(key) = self.ready.pop_front() {
                self.assign(&key);
                continue;
            }
            if std::mem::take(&mut self.rebalance_requested) {
                self.balance();
                continue;
            }
            break;
        }
    }

    // ── Worker messages ─────────────────────────────────────────────

    pub fn handle_worker_message(&mut self, msg: Message) {
        let decoded = match WorkerMessage::from_message(&msg) {
            Ok(m) => m,
            Err(e) => {
                warn!(op = %msg.op, error = %e, "undecodable worker message");
                return;
            }
        };

        let worker = decoded.worker().clone();
        if !matches!(decoded, WorkerMessage::Register { .. }) {
            match self.workers.get_mut(&worker) {
                Some(record) => record.last_seen = Instant::now(),
                None => {
                    self.handle_unknown_worker(decoded);
                    return;
                }
            }
        }

        match decoded {
            WorkerMessage::Register {
                worker,
                ncores,
                memory_limit,
            } => self.add_worker(worker, ncores, memory_limit),
            WorkerMessage::TaskFinished {
                worker,
                key,
                duration_ms,
                nbytes,
                type_tag,
            } => self.task_finished(&worker, &key, duration_ms, nbytes, type_tag),
            WorkerMessage::TaskErred {
                worker,
                key,
                failure,
            } => self.task_erred(&worker, &key, failure),
            WorkerMessage::Heartbeat {
                worker,
                memory_used,
                spilled_bytes,
                executing,
            } => {
                self.mark_executing(&worker, &executing);
                if let Some(record) = self.workers.get_mut(&worker) {
                    record.memory_used = memory_used;
                    record.spilled_bytes = spilled_bytes;
                    record.executing = executing.into_iter().collect();
                }
            }
            WorkerMessage::AddKeys { worker, keys } => self.add_keys(&worker, keys),
            WorkerMessage::MissingData {
                worker,
                key,
                missing,
                holders,
            } => self.missing_data(&worker, &key, &missing, &holders),
            WorkerMessage::StealResponse {
                worker,
                key,
                stolen,
            } => self.steal_response(&worker, &key, stolen),
            WorkerMessage::Paused { worker } => {
                if let Some(record) = self.workers.get_mut(&worker) {
                    info!(worker = %worker, "worker paused");
                    record.paused = true;
                }
            }
            WorkerMessage::Unpaused { worker } => {
                if let Some(record) = self.workers.get_mut(&worker) {
                    info!(worker = %worker, "worker resumed");
                    record.paused = false;
                }
                self.retry_unrunnable();
                self.rebalance_requested = true;
            }
            WorkerMessage::KeysReleased { worker, keys } => self.keys_released(&worker, &keys),
            WorkerMessage::Unregister { worker, reason } => self.remove_worker(&worker, &reason),
        }
    }

    fn handle_unknown_worker(&mut self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Heartbeat { worker, .. } => {
                warn!(worker = %worker, "heartbeat from unknown worker, asking it to restart");
                let _ = self
                    .network
                    .send_to_worker(&worker, &SchedulerMessage::Close { restart: true });
            }
            WorkerMessage::TaskFinished { worker, key, .. } => {
                debug!(worker = %worker, key = %key, "result from removed worker ignored");
            }
            other => {
                debug!(worker = %other.worker(), op = other.op(), "message from unknown worker");
            }
        }
    }

    fn add_worker(&mut self, worker: WorkerId, ncores: usize, memory_limit: u64) {
        if let Some(record) = self.workers.get_mut(&worker) {
            record.ncores = ncores.max(1);
            record.memory_limit = memory_limit;
            return;
        }
        let order = self.next_worker_order;
        self.next_worker_order += 1;
        info!(worker = %worker, ncores, memory_limit, "worker registered");
        self.workers.insert(
            worker.clone(),
            WorkerRecord::new(worker, ncores, memory_limit, order),
        );
        self.with_metrics(|m| m.workers_registered += 1);
        self.retry_unrunnable();
        self.rebalance_requested = true;
    }

    // ── Client requests ─────────────────────────────────────────────

    /// Handle one client request. Returns false once the scheduler should
    /// stop.
    pub fn handle_client_request(&mut self, request: ClientRequest) -> bool {
        match request {
            ClientRequest::UpdateGraph {
                client,
                tasks,
                wanted,
                reply,
            } => {
                let result = self.update_graph(client, tasks, wanted);
                let _ = reply.send(result);
            }
            ClientRequest::ReleaseKeys { client, keys } => self.release_keys(client, &keys),
            ClientRequest::Cancel { client, keys } => self.cancel(client, &keys),
            ClientRequest::WaitKey { key, reply } => self.wait_key(key, reply),
            ClientRequest::WhoHas { keys, reply } => {
                let _ = reply.send(self.who_has(&keys));
            }
            ClientRequest::HasWhat { reply } => {
                let _ = reply.send(self.has_what());
            }
            ClientRequest::KeyState { key, reply } => {
                let _ = reply.send(self.tasks.get(&key).map(|t| t.state));
            }
            ClientRequest::ScatterTargets {
                count,
                broadcast,
                reply,
            } => {
                let _ = reply.send(self.scatter_targets(count, broadcast));
            }
            ClientRequest::UpdateData {
                client,
                keys,
                reply,
            } => {
                self.update_data(client, keys);
                let _ = reply.send(());
            }
            ClientRequest::MissingData { key, worker } => self.stale_holder(&key, &worker),
            ClientRequest::Restart { reply } => {
                let n = self.restart();
                let _ = reply.send(n);
            }
            ClientRequest::Identity { reply } => {
                let _ = reply.send(self.identity());
            }
            ClientRequest::DesiredWorkers { adaptive, reply } => {
                let _ = reply.send(self.desired_workers(&adaptive));
            }
            ClientRequest::Shutdown { reply } => {
                self.close_all(false);
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    /// Tell every worker to close and drop all state. Waiters resolve as
    /// forgotten.
    pub(crate) fn close_all(&mut self, restart: bool) -> usize {
        let workers: Vec<WorkerId> = self.workers.keys().cloned().collect();
        for worker in &workers {
            let _ = self
                .network
                .send_to_worker(worker, &SchedulerMessage::Close { restart });
        }
        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(KeyOutcome::Forgotten);
            }
        }
        self.workers.clear();
        self.tasks.clear();
        self.unrunnable.clear();
        self.ready.clear();
        self.steals.clear();
        self.lost_workers.clear();
        workers.len()
    }

    fn restart(&mut self) -> usize {
        let n = self.close_all(true);
        info!(workers = n, "cluster restart: all tasks forgotten");
        n
    }
}

/// The scheduler actor: [`SchedulerState`] plus its event queue and timers.
pub struct Scheduler {
    state: SchedulerState,
    events: mpsc::UnboundedReceiver<SchedulerEvent>,
}

impl Scheduler {
    /// `events` must be the receiving half of the queue `network` sends to.
    pub fn new(
        config: SchedulerConfig,
        network: Arc<LocalNetwork>,
        events: mpsc::UnboundedReceiver<SchedulerEvent>,
    ) -> Self {
        Self {
            state: SchedulerState::new(config, network),
            events,
        }
    }

    /// Get an Arc to the metrics (for external reads without cloning).
    pub fn metrics_handle(&self) -> Arc<RwLock<SchedulerMetrics>> {
        Arc::clone(&self.state.metrics)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until a shutdown request arrives or every sender is gone.
    pub async fn run(mut self) {
        let cfg = &self.state.config;
        let mut heartbeat = interval(cfg.heartbeat_interval());
        let mut steal = interval(cfg.steal_interval());
        let mut gc = interval(cfg.gc_interval());
        for timer in [&mut heartbeat, &mut steal, &mut gc] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        info!(
            work_stealing = cfg.work_stealing,
            allowed_failures = cfg.allowed_failures,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(SchedulerEvent::Worker(msg)) => self.state.handle_worker_message(msg),
                    Some(SchedulerEvent::Client(request)) => {
                        if !self.state.handle_client_request(request) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = heartbeat.tick() => {
                    self.state.check_workers();
                    self.state.check_timeouts();
                }
                _ = steal.tick() => {
                    self.state.rebalance_requested = true;
                }
                _ = gc.tick() => self.state.collect_garbage(),
            }
            self.state.flush();
        }

        info!("Scheduler stopped");
    }
}
