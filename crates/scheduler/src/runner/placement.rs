use std::collections::BTreeMap;

use tracing::debug;

use tessera_core::{TaskKey, TaskState, WorkerId};
use tessera_protocol::{ComputeRequest, SchedulerMessage};

use crate::records::WorkerRecord;

use super::SchedulerState;

impl SchedulerState {
    /// Place one waiting task, or park it as unrunnable.
    pub(crate) fn assign(&mut self, key: &TaskKey) {
        match self.tasks.get(key) {
            Some(task) if task.state == TaskState::Waiting => {}
            _ => return,
        }
        match self.decide_worker(key) {
            Some(worker) => self.send_compute(key, &worker),
            None => {
                debug!(key = %key, "no eligible worker, task unrunnable");
                self.unrunnable.insert(key.clone());
            }
        }
    }

    /// Pick the worker for a ready task.
    ///
    /// Workers already holding some of the task's inputs are preferred,
    /// choosing the one with the fewest bytes left to fetch. Without such a
    /// worker the least busy one wins. Ties go to fewer processing tasks,
    /// then to registration order.
    pub(crate) fn decide_worker(&self, key: &TaskKey) -> Option<WorkerId> {
        let task = self.tasks.get(key)?;
        let eligible: Vec<&WorkerRecord> = self
            .workers
            .values()
            .filter(|w| !w.paused && task.allows(&w.id))
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let candidates: Vec<&WorkerRecord> = eligible
            .iter()
            .copied()
            .filter(|w| {
                task.dependencies
                    .iter()
                    .any(|dep| w.has_what.contains(dep))
            })
            .collect();

        let chosen = if candidates.is_empty() {
            eligible
                .iter()
                .min_by_key(|w| (w.processing.len(), w.order))
                .copied()
        } else {
            candidates
                .iter()
                .min_by_key(|w| (self.missing_bytes(key, &w.id), w.processing.len(), w.order))
                .copied()
        };
        chosen.map(|w| w.id.clone())
    }

    /// Bytes of `key`'s dependencies `worker` would have to fetch.
    pub(crate) fn missing_bytes(&self, key: &TaskKey, worker: &WorkerId) -> u64 {
        let (Some(task), Some(record)) = (self.tasks.get(key), self.workers.get(worker)) else {
            return 0;
        };
        task.dependencies
            .iter()
            .filter(|dep| !record.has_what.contains(*dep))
            .filter_map(|dep| self.tasks.get(dep))
            .map(|dep| dep.nbytes)
            .sum()
    }

    /// Mark `key` processing on `worker` and send it the compute request.
    pub(crate) fn send_compute(&mut self, key: &TaskKey, worker: &WorkerId) {
        let Some(task) = self.tasks.get(key) else {
            return;
        };
        let Some(spec) = task.spec.as_ref() else {
            return;
        };

        let mut who_has = BTreeMap::new();
        let mut nbytes = BTreeMap::new();
        for dep in &task.dependencies {
            if let Some(d) = self.tasks.get(dep) {
                who_has.insert(dep.clone(), d.who_has.iter().cloned().collect());
                nbytes.insert(dep.clone(), d.nbytes);
            }
        }
        let request = ComputeRequest {
            key: key.clone(),
            function: spec.function.clone(),
            args: spec.args.clone(),
            kwargs: spec.kwargs.clone(),
            who_has,
            nbytes,
            pure: spec.pure,
            priority: task.priority,
        };
        let estimate = self.durations.estimate(&spec.function);

        let Some(record) = self.workers.get_mut(worker) else {
            return;
        };
        record.processing.insert(key.clone(), estimate);
        if let Some(task) = self.tasks.get_mut(key) {
            task.state = TaskState::Processing;
            task.processing_on = Some(worker.clone());
        }
        self.unrunnable.remove(key);
        debug!(key = %key, worker = %worker, "processing");

        if !self.send(worker, SchedulerMessage::Compute(request)) {
            // The worker is gone before it ever saw the task. Undo so the
            // task is not blamed for the crash.
            if let Some(record) = self.workers.get_mut(worker) {
                record.processing.shift_remove(key);
            }
            if let Some(task) = self.tasks.get_mut(key) {
                task.state = TaskState::Waiting;
                task.processing_on = None;
                task.started = None;
            }
            self.unrunnable.insert(key.clone());
        }
    }

    /// Give every parked task another placement attempt.
    pub(crate) fn retry_unrunnable(&mut self) {
        if self.unrunnable.is_empty() {
            return;
        }
        let mut keys: Vec<TaskKey> = std::mem::take(&mut self.unrunnable).into_iter().collect();
        keys.sort_by_key(|k| self.tasks.get(k).map(|t| t.priority).unwrap_or(u64::MAX));
        self.ready.extend(keys);
    }

    /// Destination workers for `count` scattered values.
    ///
    /// With `broadcast` every value goes to every worker. Otherwise values
    /// are dealt round-robin, each worker taking as many turns per round as
    /// it has free cores.
    pub(crate) fn scatter_targets(&self, count: usize, broadcast: bool) -> Vec<Vec<WorkerId>> {
        let running: Vec<&WorkerRecord> = self.workers.values().filter(|w| !w.paused).collect();
        if running.is_empty() || count == 0 {
            return Vec::new();
        }
        if broadcast {
            let all: Vec<WorkerId> = running.iter().map(|w| w.id.clone()).collect();
            return vec![all; count];
        }

        let weight = |w: &WorkerRecord| w.free_cores().max(1);
        let rounds = running.iter().map(|w| weight(w)).max().unwrap_or(1);
        let mut slots = Vec::new();
        for round in 0..rounds {
            for w in &running {
                if weight(w) > round {
                    slots.push(w.id.clone());
                }
            }
        }
        (0..count).map(|i| vec![slots[i % slots.len()].clone()]).collect()
    }
}
