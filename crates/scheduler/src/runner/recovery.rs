use std::time::Instant;

use tracing::{debug, error, warn};

use tessera_core::{TaskFailure, TaskKey, TaskState, WorkerId};
use tessera_protocol::SchedulerMessage;

use super::SchedulerState;

impl SchedulerState {
    /// Drop a worker and recover everything that depended on it.
    ///
    /// Keys whose only copy lived there are recomputed when still needed,
    /// or become `lost-data` when they were scattered. Tasks that were
    /// processing there are re-queued, unless this was the
    /// `allowed_failures`-th worker to die under them.
    pub(crate) fn remove_worker(&mut self, worker: &WorkerId, reason: &str) {
        let Some(record) = self.workers.shift_remove(worker) else {
            return;
        };
        warn!(
            worker = %worker,
            reason,
            processing = record.processing.len(),
            keys = record.has_what.len(),
            "worker lost"
        );
        self.with_metrics(|m| m.workers_lost += 1);
        // A worker we gave up on may still be running; make it start over.
        let _ = self
            .network
            .send_to_worker(worker, &SchedulerMessage::Close { restart: true });

        self.steals
            .retain(|_, s| s.victim != *worker && s.thief != *worker);

        for key in &record.releasing {
            if let Some(task) = self.tasks.get_mut(key) {
                task.release_pending.remove(worker);
            }
        }

        for key in &record.has_what {
            let Some(task) = self.tasks.get_mut(key) else {
                continue;
            };
            task.who_has.remove(worker);
            if task.who_has.is_empty() && task.state == TaskState::Memory {
                debug!(key = %key, worker = %worker, "last copy lost");
                self.lose_data(key);
            }
        }

        let allowed = self.config.allowed_failures;
        for key in record.processing.keys() {
            let Some(task) = self.tasks.get_mut(key) else {
                continue;
            };
            if task.state != TaskState::Processing || task.processing_on.as_ref() != Some(worker) {
                continue;
            }
            task.processing_on = None;
            task.started = None;
            task.crashes += 1;
            let crashes = task.crashes;

            if crashes >= allowed {
                error!(
                    key = %key,
                    crashes,
                    "task killed {crashes} workers, marking it suspicious"
                );
                self.with_metrics(|m| m.suspicious_tasks += 1);
                self.mark_erred(key, TaskFailure::suspicious(key.clone(), crashes));
            } else {
                task.state = TaskState::Released;
                if self.is_needed(key) {
                    self.recompute(key);
                }
            }
        }

        self.retry_unrunnable();
    }

    /// A worker could not fetch `missing` for `key` from any of `holders`.
    pub(crate) fn missing_data(
        &mut self,
        worker: &WorkerId,
        key: &TaskKey,
        missing: &TaskKey,
        holders: &[WorkerId],
    ) {
        debug!(worker = %worker, key = %key, missing = %missing, "missing data");
        for holder in holders {
            self.stale_holder(missing, holder);
        }

        let Some(task) = self.tasks.get_mut(key) else {
            return;
        };
        if task.state != TaskState::Processing || task.processing_on.as_ref() != Some(worker) {
            return;
        }
        task.processing_on = None;
        task.started = None;
        task.state = TaskState::Pending;
        self.steals.remove(key);
        if let Some(record) = self.workers.get_mut(worker) {
            record.processing.shift_remove(key);
        }
        self.recompute(missing);
        self.update_readiness(key);
    }

    /// `holder` turned out not to have `key`. Drop the location, or the
    /// whole worker if it is unreachable.
    pub(crate) fn stale_holder(&mut self, key: &TaskKey, holder: &WorkerId) {
        if !self.workers.contains_key(holder) {
            return;
        }
        if !self.network.is_reachable(holder) {
            self.remove_worker(holder, "unreachable for data transfer");
            return;
        }
        let Some(task) = self.tasks.get_mut(key) else {
            return;
        };
        if !task.who_has.remove(holder) {
            return;
        }
        let nbytes = task.nbytes;
        if let Some(record) = self.workers.get_mut(holder) {
            record.remove_key(key, nbytes);
        }
        warn!(key = %key, worker = %holder, "dropping stale replica");
        self.lose_data(key);
    }

    /// Remove workers that stopped heartbeating or whose channels closed.
    pub(crate) fn check_workers(&mut self) {
        let now = Instant::now();
        let ttl = self.config.worker_ttl();
        let dead: Vec<(WorkerId, &'static str)> = self
            .workers
            .values()
            .filter_map(|w| {
                if !self.network.is_reachable(&w.id) {
                    Some((w.id.clone(), "connection closed"))
                } else if now.duration_since(w.last_seen) > ttl {
                    Some((w.id.clone(), "heartbeat timeout"))
                } else {
                    None
                }
            })
            .collect();
        for (worker, reason) in dead {
            self.remove_worker(&worker, reason);
        }
    }

    /// Start the deadline clock for tasks `worker` reports as running.
    /// Tasks still queued on the worker have no deadline yet.
    pub(crate) fn mark_executing(&mut self, worker: &WorkerId, executing: &[TaskKey]) {
        let now = Instant::now();
        for key in executing {
            if let Some(task) = self.tasks.get_mut(key) {
                if task.state == TaskState::Processing
                    && task.processing_on.as_ref() == Some(worker)
                    && task.started.is_none()
                {
                    task.started = Some(now);
                }
            }
        }
    }

    /// Fail tasks that have been executing longer than `task_timeout`.
    pub(crate) fn check_timeouts(&mut self) {
        let Some(limit) = self.config.task_timeout() else {
            return;
        };
        let expired: Vec<(TaskKey, WorkerId)> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Processing)
            .filter(|t| t.started.is_some_and(|s| s.elapsed() > limit))
            .filter_map(|t| t.processing_on.clone().map(|w| (t.key.clone(), w)))
            .collect();

        let limit_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
        for (key, worker) in expired {
            warn!(key = %key, worker = %worker, limit_ms, "task timed out");
            if let Some(record) = self.workers.get_mut(&worker) {
                record.processing.shift_remove(&key);
            }
            if let Some(task) = self.tasks.get_mut(&key) {
                task.processing_on = None;
                task.started = None;
            }
            self.steals.remove(&key);
            self.send(&worker, SchedulerMessage::Cancel { key: key.clone() });
            self.with_metrics(|m| m.tasks_erred += 1);
            self.mark_erred(&key, TaskFailure::timeout(key.clone(), limit_ms));
        }
        self.retry_unrunnable();
    }
}
