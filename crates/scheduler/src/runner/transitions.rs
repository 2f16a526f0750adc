use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use tessera_core::{TaskFailure, TaskKey, TaskState, WorkerId};
use tessera_protocol::{KeyOutcome, SchedulerMessage};

use super::SchedulerState;

impl SchedulerState {
    // ── Completion ──────────────────────────────────────────────────

    pub(crate) fn task_finished(
        &mut self,
        worker: &WorkerId,
        key: &TaskKey,
        duration_ms: f64,
        nbytes: u64,
        type_tag: String,
    ) {
        let Some(task) = self.tasks.get_mut(key) else {
            self.release_stray(worker, key);
            return;
        };
        match task.state {
            TaskState::Processing if task.processing_on.as_ref() == Some(worker) => {}
            TaskState::Memory => {
                task.who_has.insert(worker.clone());
                if let Some(w) = self.workers.get_mut(worker) {
                    w.add_key(key, nbytes);
                }
                return;
            }
            state => {
                debug!(key = %key, worker = %worker, state = %state, "discarding late result");
                self.release_stray(worker, key);
                return;
            }
        }

        task.state = TaskState::Memory;
        task.who_has.insert(worker.clone());
        task.processing_on = None;
        task.started = None;
        task.nbytes = nbytes;
        task.type_tag = type_tag;
        task.failure = None;
        let function = task.function().unwrap_or_default().to_string();
        self.steals.remove(key);

        let duration = Duration::from_secs_f64(duration_ms.max(0.0) / 1000.0);
        self.durations.observe(&function, duration);
        self.with_metrics(|m| m.record_execution(&function, duration));

        if let Some(w) = self.workers.get_mut(worker) {
            w.processing.shift_remove(key);
            w.add_key(key, nbytes);
            if w.processing.is_empty() {
                self.rebalance_requested = true;
            }
        }
        debug!(key = %key, worker = %worker, nbytes, "memory");

        self.resolve_memory_waiters(key);
        self.dependents_ready(key);
        self.retry_unrunnable();
    }

    /// Tell a worker to drop a result nobody is waiting for.
    pub(crate) fn release_stray(&mut self, worker: &WorkerId, key: &TaskKey) {
        self.send(
            worker,
            SchedulerMessage::ReleaseKeys {
                keys: vec![key.clone()],
            },
        );
    }

    // ── Errors ──────────────────────────────────────────────────────

    pub(crate) fn task_erred(&mut self, worker: &WorkerId, key: &TaskKey, failure: TaskFailure) {
        let Some(task) = self.tasks.get_mut(key) else {
            return;
        };
        if task.state != TaskState::Processing || task.processing_on.as_ref() != Some(worker) {
            debug!(key = %key, worker = %worker, "ignoring stale task error");
            return;
        }
        task.processing_on = None;
        task.started = None;
        self.steals.remove(key);
        if let Some(w) = self.workers.get_mut(worker) {
            w.processing.shift_remove(key);
        }

        let Some(task) = self.tasks.get_mut(key) else {
            return;
        };
        if task.retries_remaining > 0 {
            task.retries_remaining -= 1;
            task.state = TaskState::Waiting;
            warn!(
                key = %key,
                error = %failure,
                retries_left = task.retries_remaining,
                "task failed, retrying"
            );
            self.with_metrics(|m| m.tasks_retried += 1);
            self.ready.push_back(key.clone());
            return;
        }

        warn!(key = %key, worker = %worker, error = %failure, "task erred");
        self.with_metrics(|m| m.tasks_erred += 1);
        self.mark_erred(key, failure);
        self.retry_unrunnable();
    }

    /// Mark `key` and every dependent that has not produced a result as
    /// erred with `failure`.
    pub(crate) fn mark_erred(&mut self, key: &TaskKey, failure: TaskFailure) {
        let mut stack = vec![key.clone()];
        while let Some(current) = stack.pop() {
            let Some(task) = self.tasks.get_mut(&current) else {
                continue;
            };
            if current != *key
                && matches!(
                    task.state,
                    TaskState::Memory | TaskState::Error | TaskState::Processing
                )
            {
                continue;
            }
            task.state = TaskState::Error;
            task.failure = Some(failure.clone());
            task.who_has.clear();
            stack.extend(task.dependents.iter().cloned());
            self.unrunnable.remove(&current);
            debug!(key = %current, blamed = %failure.key, "error");
            self.resolve_waiters(&current, KeyOutcome::Error(failure.clone()));
        }
    }

    // ── Readiness ───────────────────────────────────────────────────

    /// Move a pending task to waiting once every dependency is in memory,
    /// or to error once any dependency erred.
    pub(crate) fn update_readiness(&mut self, key: &TaskKey) {
        let Some(task) = self.tasks.get(key) else {
            return;
        };
        if task.state != TaskState::Pending {
            return;
        }

        let mut all_ready = true;
        let mut failed = None;
        for dep in &task.dependencies {
            match self.tasks.get(dep) {
                Some(d) if d.state == TaskState::Memory => {}
                Some(d) if d.state == TaskState::Error => {
                    failed = d.failure.clone();
                    break;
                }
                _ => all_ready = false,
            }
        }

        if let Some(failure) = failed {
            self.mark_erred(key, failure);
        } else if all_ready {
            if let Some(task) = self.tasks.get_mut(key) {
                task.state = TaskState::Waiting;
                self.ready.push_back(key.clone());
            }
        }
    }

    pub(crate) fn dependents_ready(&mut self, key: &TaskKey) {
        let dependents: Vec<TaskKey> = match self.tasks.get(key) {
            Some(task) => task.dependents.iter().cloned().collect(),
            None => return,
        };
        for dependent in &dependents {
            self.update_readiness(dependent);
        }
    }

    /// Bring a released task back to life, recomputing released ancestors
    /// first. Tasks in any other state are left alone.
    pub(crate) fn recompute(&mut self, key: &TaskKey) {
        let Some(task) = self.tasks.get_mut(key) else {
            return;
        };
        if task.state != TaskState::Released {
            return;
        }
        if task.spec.is_none() {
            warn!(key = %key, "released data has no recipe");
            self.mark_erred(key, TaskFailure::lost_data(key.clone()));
            return;
        }
        task.state = TaskState::Pending;
        debug!(key = %key, "recomputing");
        let deps: Vec<TaskKey> = task.dependencies.iter().cloned().collect();
        for dep in &deps {
            self.recompute(dep);
        }
        self.update_readiness(key);
    }

    /// Whether a future or an unfinished dependent still references `key`.
    pub(crate) fn is_needed(&self, key: &TaskKey) -> bool {
        let Some(task) = self.tasks.get(key) else {
            return false;
        };
        !task.who_wants.is_empty()
            || task.dependents.iter().any(|d| {
                self.tasks
                    .get(d)
                    .is_some_and(|t| !t.state.is_finished())
            })
    }

    /// The last holder of `key` is gone.
    pub(crate) fn lose_data(&mut self, key: &TaskKey) {
        let Some(task) = self.tasks.get_mut(key) else {
            return;
        };
        if task.state != TaskState::Memory || !task.who_has.is_empty() {
            return;
        }
        if task.spec.is_none() {
            warn!(key = %key, "only copy of scattered data lost");
            self.mark_erred(key, TaskFailure::lost_data(key.clone()));
            return;
        }
        task.state = TaskState::Released;
        let dependents: Vec<TaskKey> = task.dependents.iter().cloned().collect();
        for dependent in &dependents {
            if let Some(d) = self.tasks.get_mut(dependent) {
                if d.state == TaskState::Waiting {
                    d.state = TaskState::Pending;
                    self.unrunnable.remove(dependent);
                }
            }
        }
        if self.is_needed(key) {
            self.recompute(key);
        }
    }

    // ── Forgetting ──────────────────────────────────────────────────

    /// Remove a task record for good.
    pub(crate) fn forget(&mut self, key: &TaskKey) {
        let Some(task) = self.tasks.remove(key) else {
            return;
        };
        for dep in &task.dependencies {
            if let Some(d) = self.tasks.get_mut(dep) {
                d.dependents.remove(key);
            }
        }
        if let Some(worker) = &task.processing_on {
            if let Some(w) = self.workers.get_mut(worker) {
                w.processing.shift_remove(key);
            }
        }
        for holder in &task.who_has {
            if let Some(w) = self.workers.get_mut(holder) {
                w.remove_key(key, task.nbytes);
            }
        }
        for holder in &task.release_pending {
            if let Some(w) = self.workers.get_mut(holder) {
                w.releasing.remove(key);
            }
        }
        self.unrunnable.remove(key);
        self.steals.remove(key);
        self.resolve_waiters(key, KeyOutcome::Forgotten);
        self.with_metrics(|m| m.keys_forgotten += 1);
        debug!(key = %key, "forgotten");
    }

    // ── Waiters ─────────────────────────────────────────────────────

    pub(crate) fn wait_key(&mut self, key: TaskKey, reply: oneshot::Sender<KeyOutcome>) {
        let outcome = match self.tasks.get(&key) {
            None => Some(KeyOutcome::Forgotten),
            Some(task) => match task.state {
                TaskState::Memory => Some(KeyOutcome::Memory {
                    who_has: task.who_has.iter().cloned().collect(),
                    nbytes: task.nbytes,
                    type_tag: task.type_tag.clone(),
                }),
                TaskState::Error => Some(KeyOutcome::Error(
                    task.failure
                        .clone()
                        .unwrap_or_else(|| TaskFailure::lost_data(key.clone())),
                )),
                _ => None,
            },
        };
        match outcome {
            Some(outcome) => {
                let _ = reply.send(outcome);
            }
            None => {
                let waiters = self.waiters.entry(key).or_default();
                waiters.retain(|w| !w.is_closed());
                waiters.push(reply);
            }
        }
    }

    pub(crate) fn resolve_waiters(&mut self, key: &TaskKey, outcome: KeyOutcome) {
        if let Some(waiters) = self.waiters.remove(key) {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    pub(crate) fn resolve_memory_waiters(&mut self, key: &TaskKey) {
        let Some(task) = self.tasks.get(key) else {
            return;
        };
        let outcome = KeyOutcome::Memory {
            who_has: task.who_has.iter().cloned().collect(),
            nbytes: task.nbytes,
            type_tag: task.type_tag.clone(),
        };
        self.resolve_waiters(key, outcome);
    }
}
