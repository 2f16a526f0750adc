use tracing::{debug, info, warn};

use tessera_core::{
    ClientId, GraphError, TaskFailure, TaskGraph, TaskKey, TaskSpec, TaskState, WorkerId,
};
use tessera_protocol::{KeyOutcome, ScatteredKey, SchedulerMessage};

use crate::records::TaskRecord;

use super::SchedulerState;

impl SchedulerState {
    /// Insert new tasks and mark `wanted` as held by `client`.
    ///
    /// Keys the scheduler already knows keep their existing record. The
    /// update is rejected as a whole if it references an unknown key or
    /// contains a cycle.
    pub(crate) fn update_graph(
        &mut self,
        client: ClientId,
        tasks: Vec<(TaskKey, TaskSpec)>,
        wanted: Vec<TaskKey>,
    ) -> Result<(), GraphError> {
        let mut graph = TaskGraph::new();
        for (key, spec) in tasks {
            if !self.tasks.contains_key(&key) {
                graph.insert(key, spec)?;
            }
        }

        for dependency in graph.external_dependencies() {
            if !self.tasks.contains_key(&dependency) {
                let task = graph
                    .keys()
                    .find(|k| {
                        graph
                            .get(k)
                            .is_some_and(|s| s.dependencies().contains(&dependency))
                    })
                    .cloned()
                    .unwrap_or_else(|| dependency.clone());
                return Err(GraphError::UnknownDependency { task, dependency });
            }
        }

        let ordered = graph.into_ordered_tasks()?;
        let mut new_keys = Vec::with_capacity(ordered.len());
        for (key, spec) in ordered {
            let priority = self.next_priority();
            let record = TaskRecord::new(key.clone(), spec, priority);
            for dep in &record.dependencies {
                if let Some(d) = self.tasks.get_mut(dep) {
                    d.dependents.insert(key.clone());
                }
            }
            self.tasks.insert(key.clone(), record);
            new_keys.push(key);
        }

        for key in &wanted {
            if let Some(task) = self.tasks.get_mut(key) {
                task.who_wants.insert(client);
            }
        }

        for key in &new_keys {
            let deps: Vec<TaskKey> = self.tasks[key].dependencies.iter().cloned().collect();
            for dep in &deps {
                self.recompute(dep);
            }
            self.update_readiness(key);
        }
        for key in &wanted {
            self.recompute(key);
        }

        if !new_keys.is_empty() {
            info!(client = %client, tasks = new_keys.len(), "graph updated");
        }
        Ok(())
    }

    /// Drop `client`'s reference. Garbage collection does the rest.
    pub(crate) fn release_keys(&mut self, client: ClientId, keys: &[TaskKey]) {
        for key in keys {
            if let Some(task) = self.tasks.get_mut(key) {
                task.who_wants.remove(&client);
            }
        }
    }

    /// Drop `client`'s reference and forget work nobody else needs.
    ///
    /// Tasks that have not started are forgotten right away. A task already
    /// processing runs to completion and is collected afterwards. Waiters
    /// on cancelled keys resolve as forgotten either way.
    pub(crate) fn cancel(&mut self, client: ClientId, keys: &[TaskKey]) {
        for key in keys {
            let Some(task) = self.tasks.get_mut(key) else {
                continue;
            };
            task.who_wants.remove(&client);
            if !task.who_wants.is_empty() || !task.dependents.is_empty() {
                continue;
            }
            info!(client = %client, key = %key, state = %task.state, "cancelled");
            match task.state {
                TaskState::Processing | TaskState::Memory => {
                    self.resolve_waiters(key, KeyOutcome::Forgotten);
                }
                _ if task.who_has.is_empty() && task.release_pending.is_empty() => {
                    self.forget(key);
                }
                _ => self.resolve_waiters(key, KeyOutcome::Forgotten),
            }
        }
    }

    /// Record values a client pushed straight into worker stores.
    pub(crate) fn update_data(&mut self, client: ClientId, keys: Vec<ScatteredKey>) {
        for scattered in keys {
            let ScatteredKey {
                key,
                nbytes,
                type_tag,
                workers,
            } = scattered;

            if !self.tasks.contains_key(&key) {
                let priority = self.next_priority();
                self.tasks.insert(
                    key.clone(),
                    TaskRecord::scattered(key.clone(), nbytes, type_tag.clone(), priority),
                );
            }

            let holders: Vec<_> = workers
                .into_iter()
                .filter(|w| self.workers.contains_key(w))
                .collect();
            for holder in &holders {
                if let Some(w) = self.workers.get_mut(holder) {
                    w.add_key(&key, nbytes);
                }
            }

            let Some(task) = self.tasks.get_mut(&key) else {
                continue;
            };
            task.who_wants.insert(client);
            task.who_has.extend(holders);
            task.nbytes = nbytes;
            task.type_tag = type_tag;

            if task.who_has.is_empty() {
                warn!(key = %key, "scattered to workers that are gone");
                self.mark_erred(&key, TaskFailure::lost_data(key.clone()));
                continue;
            }
            if task.state != TaskState::Memory {
                task.state = TaskState::Memory;
                task.failure = None;
                debug!(key = %key, holders = task.who_has.len(), "scattered");
                self.resolve_memory_waiters(&key);
                self.dependents_ready(&key);
            }
        }
    }

    /// Replicas a worker fetched for its own tasks.
    pub(crate) fn add_keys(&mut self, worker: &WorkerId, keys: Vec<(TaskKey, u64)>) {
        let mut stray = Vec::new();
        for (key, nbytes) in keys {
            match self.tasks.get_mut(&key) {
                Some(task) if task.state == TaskState::Memory => {
                    task.who_has.insert(worker.clone());
                    if let Some(w) = self.workers.get_mut(worker) {
                        w.add_key(&key, nbytes);
                    }
                }
                _ => stray.push(key),
            }
        }
        if !stray.is_empty() {
            self.send(worker, SchedulerMessage::ReleaseKeys { keys: stray });
        }
    }
}
