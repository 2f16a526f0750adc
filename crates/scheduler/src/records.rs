use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use tessera_core::{ClientId, TaskFailure, TaskKey, TaskSpec, TaskState, WorkerId};

/// Scheduler-side view of one key.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub key: TaskKey,
    /// Recipe to (re)compute the key. `None` for scattered data.
    pub spec: Option<TaskSpec>,
    pub state: TaskState,
    pub dependencies: BTreeSet<TaskKey>,
    pub dependents: BTreeSet<TaskKey>,
    /// Workers holding the result. Non-empty exactly when in memory.
    pub who_has: BTreeSet<WorkerId>,
    /// Clients holding a future for this key.
    pub who_wants: BTreeSet<ClientId>,
    pub processing_on: Option<WorkerId>,
    /// First time the holder's heartbeat listed the task as executing.
    pub started: Option<Instant>,
    pub nbytes: u64,
    pub type_tag: String,
    pub retries_remaining: u32,
    /// Workers that died while running this task.
    pub crashes: u32,
    pub priority: u64,
    pub failure: Option<TaskFailure>,
    /// Holders told to drop the key that have not acknowledged yet.
    pub release_pending: BTreeSet<WorkerId>,
    pub release_deadline: Option<Instant>,
}

impl TaskRecord {
    pub fn new(key: TaskKey, spec: TaskSpec, priority: u64) -> Self {
        Self {
            dependencies: spec.dependencies(),
            retries_remaining: spec.retries,
            spec: Some(spec),
            ..Self::empty(key, priority)
        }
    }

    /// Record for data pushed straight into worker stores.
    pub fn scattered(key: TaskKey, nbytes: u64, type_tag: String, priority: u64) -> Self {
        Self {
            nbytes,
            type_tag,
            ..Self::empty(key, priority)
        }
    }

    fn empty(key: TaskKey, priority: u64) -> Self {
        Self {
            key,
            spec: None,
            state: TaskState::Pending,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            who_has: BTreeSet::new(),
            who_wants: BTreeSet::new(),
            processing_on: None,
            started: None,
            nbytes: 0,
            type_tag: String::new(),
            retries_remaining: 0,
            crashes: 0,
            priority,
            failure: None,
            release_pending: BTreeSet::new(),
            release_deadline: None,
        }
    }

    pub fn function(&self) -> Option<&str> {
        self.spec.as_ref().map(|s| s.function.as_str())
    }

    pub fn is_pure(&self) -> bool {
        self.spec.as_ref().is_some_and(|s| s.pure)
    }

    /// Whether `worker` satisfies the task's placement restriction.
    pub fn allows(&self, worker: &WorkerId) -> bool {
        match self.spec.as_ref().and_then(|s| s.workers.as_ref()) {
            Some(allowed) => allowed.contains(worker),
            None => true,
        }
    }
}

/// Scheduler-side view of one worker.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub ncores: usize,
    pub memory_limit: u64,
    /// Registration order, used as the final placement tie-break.
    pub order: u64,
    /// Assigned tasks in assignment order, with their duration estimates.
    pub processing: IndexMap<TaskKey, Duration>,
    pub has_what: BTreeSet<TaskKey>,
    /// Keys released on this worker awaiting `keys-released`.
    pub releasing: BTreeSet<TaskKey>,
    /// Bytes of results the scheduler believes the worker holds.
    pub nbytes: u64,
    pub memory_used: u64,
    pub spilled_bytes: u64,
    pub executing: BTreeSet<TaskKey>,
    pub last_seen: Instant,
    pub paused: bool,
}

impl WorkerRecord {
    pub fn new(id: WorkerId, ncores: usize, memory_limit: u64, order: u64) -> Self {
        Self {
            id,
            ncores: ncores.max(1),
            memory_limit,
            order,
            processing: IndexMap::new(),
            has_what: BTreeSet::new(),
            releasing: BTreeSet::new(),
            nbytes: 0,
            memory_used: 0,
            spilled_bytes: 0,
            executing: BTreeSet::new(),
            last_seen: Instant::now(),
            paused: false,
        }
    }

    /// Expected seconds to drain the processing queue.
    pub fn occupancy(&self) -> f64 {
        let total: Duration = self.processing.values().sum();
        total.as_secs_f64() / self.ncores as f64
    }

    pub fn free_cores(&self) -> usize {
        self.ncores.saturating_sub(self.processing.len())
    }

    pub fn add_key(&mut self, key: &TaskKey, nbytes: u64) {
        if self.has_what.insert(key.clone()) {
            self.nbytes += nbytes;
        }
    }

    pub fn remove_key(&mut self, key: &TaskKey, nbytes: u64) -> bool {
        let removed = self.has_what.remove(key);
        if removed {
            self.nbytes = self.nbytes.saturating_sub(nbytes);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occupancy_divides_by_cores() {
        let mut w = WorkerRecord::new(WorkerId::from("w"), 2, 100, 0);
        w.processing.insert(TaskKey::from("a"), Duration::from_secs(1));
        w.processing.insert(TaskKey::from("b"), Duration::from_secs(3));
        assert!((w.occupancy() - 2.0).abs() < 1e-9);
        assert_eq!(w.free_cores(), 0);
    }

    #[test]
    fn key_accounting_is_idempotent() {
        let mut w = WorkerRecord::new(WorkerId::from("w"), 1, 100, 0);
        let k = TaskKey::from("k");
        w.add_key(&k, 10);
        w.add_key(&k, 10);
        assert_eq!(w.nbytes, 10);
        assert!(w.remove_key(&k, 10));
        assert!(!w.remove_key(&k, 10));
        assert_eq!(w.nbytes, 0);
    }

    #[test]
    fn restrictions_filter_workers() {
        let mut spec = TaskSpec::new("f");
        spec.workers = Some(vec![WorkerId::from("w1")]);
        let task = TaskRecord::new(TaskKey::from("k"), spec, 0);
        assert!(task.allows(&WorkerId::from("w1")));
        assert!(!task.allows(&WorkerId::from("w2")));
    }
}
