use std::collections::{BTreeMap, BTreeSet};

use tessera_core::{AdaptiveConfig, TaskKey, TaskState, WorkerId};
use tessera_protocol::{ClusterInfo, WorkerInfo};

use super::SchedulerState;

impl SchedulerState {
    pub(crate) fn who_has(&self, keys: &[TaskKey]) -> BTreeMap<TaskKey, BTreeSet<WorkerId>> {
        keys.iter()
            .map(|k| {
                let holders = self
                    .tasks
                    .get(k)
                    .map(|t| t.who_has.clone())
                    .unwrap_or_default();
                (k.clone(), holders)
            })
            .collect()
    }

    pub(crate) fn has_what(&self) -> BTreeMap<WorkerId, BTreeSet<TaskKey>> {
        self.workers
            .values()
            .map(|w| (w.id.clone(), w.has_what.clone()))
            .collect()
    }

    pub fn identity(&self) -> ClusterInfo {
        ClusterInfo {
            workers: self
                .workers
                .values()
                .map(|w| WorkerInfo {
                    id: w.id.clone(),
                    ncores: w.ncores,
                    memory_limit: w.memory_limit,
                    memory_used: w.memory_used,
                    spilled_bytes: w.spilled_bytes,
                    processing: w.processing.len(),
                    keys: w.has_what.len(),
                    paused: w.paused,
                })
                .collect(),
            tasks: self.tasks.len(),
            unrunnable: self.unrunnable.len(),
        }
    }

    /// Workers needed to finish all outstanding work within
    /// `target_duration`, clamped to the adaptive bounds.
    pub(crate) fn desired_workers(&self, adaptive: &AdaptiveConfig) -> usize {
        let outstanding: f64 = self
            .tasks
            .values()
            .filter(|t| {
                matches!(
                    t.state,
                    TaskState::Pending | TaskState::Waiting | TaskState::Processing
                )
            })
            .filter_map(|t| t.function())
            .map(|f| self.durations.estimate(f).as_secs_f64())
            .sum();
        let target = adaptive.target_duration().as_secs_f64().max(1e-3);
        let wanted = (outstanding / target).ceil() as usize;
        wanted.clamp(adaptive.minimum, adaptive.maximum.max(adaptive.minimum))
    }
}
