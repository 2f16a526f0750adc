use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, warn};

use tessera_core::{TaskKey, TaskState, WorkerId};
use tessera_protocol::{KeyOutcome, SchedulerMessage};

use super::SchedulerState;

impl SchedulerState {
    /// One garbage collection sweep.
    ///
    /// A key is collectable when no client wants it, nothing depends on it,
    /// and it is not processing. Keys without data are forgotten at once.
    /// Keys with data are released on every holder, and the record goes
    /// away once all holders acknowledge (or `release_timeout` passes).
    pub(crate) fn collect_garbage(&mut self) {
        let now = Instant::now();
        self.expire_releases(now);

        let candidates: Vec<TaskKey> = self
            .tasks
            .values()
            .filter(|t| {
                t.who_wants.is_empty()
                    && t.dependents.is_empty()
                    && t.state != TaskState::Processing
                    && t.release_pending.is_empty()
            })
            .map(|t| t.key.clone())
            .collect();
        if candidates.is_empty() {
            return;
        }

        let deadline = now + self.config.release_timeout();
        let mut batches: BTreeMap<WorkerId, Vec<TaskKey>> = BTreeMap::new();
        for key in candidates {
            let Some(task) = self.tasks.get_mut(&key) else {
                continue;
            };
            if task.who_has.is_empty() {
                self.forget(&key);
                continue;
            }

            let holders = std::mem::take(&mut task.who_has);
            let nbytes = task.nbytes;
            task.state = TaskState::Released;
            task.release_deadline = Some(deadline);
            task.release_pending = holders.clone();
            for holder in holders {
                if let Some(record) = self.workers.get_mut(&holder) {
                    record.remove_key(&key, nbytes);
                    record.releasing.insert(key.clone());
                }
                batches.entry(holder).or_default().push(key.clone());
            }
            self.resolve_waiters(&key, KeyOutcome::Forgotten);
        }

        for (worker, keys) in batches {
            debug!(worker = %worker, keys = keys.len(), "releasing keys");
            self.send(&worker, SchedulerMessage::ReleaseKeys { keys });
        }
    }

    /// Give up on holders that never acknowledged a release.
    fn expire_releases(&mut self, now: Instant) {
        let expired: Vec<TaskKey> = self
            .tasks
            .values()
            .filter(|t| !t.release_pending.is_empty())
            .filter(|t| t.release_deadline.is_some_and(|d| now >= d))
            .map(|t| t.key.clone())
            .collect();

        for key in expired {
            let Some(task) = self.tasks.get_mut(&key) else {
                continue;
            };
            let pending = std::mem::take(&mut task.release_pending);
            task.release_deadline = None;
            warn!(
                key = %key,
                workers = ?pending,
                "release not acknowledged in time, data may be leaked"
            );
            for worker in &pending {
                if let Some(record) = self.workers.get_mut(worker) {
                    record.releasing.remove(&key);
                }
            }
            self.with_metrics(|m| m.release_leaks += 1);
        }
    }

    pub(crate) fn keys_released(&mut self, worker: &WorkerId, keys: &[TaskKey]) {
        if let Some(record) = self.workers.get_mut(worker) {
            for key in keys {
                record.releasing.remove(key);
            }
        }
        for key in keys {
            if let Some(task) = self.tasks.get_mut(key) {
                task.release_pending.remove(worker);
                if task.release_pending.is_empty() {
                    task.release_deadline = None;
                }
            }
        }
    }
}
