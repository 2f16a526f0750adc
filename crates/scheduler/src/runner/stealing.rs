use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use tessera_core::{TaskKey, TaskState, WorkerId};
use tessera_protocol::SchedulerMessage;

use super::core::InFlightSteal;
use super::SchedulerState;

impl SchedulerState {
    /// Move queued work from busy workers to idle ones.
    ///
    /// Victims are workers above the average occupancy with more tasks
    /// than cores. Thieves are workers below half the average or with a
    /// free core. Only tasks queued behind a victim's busy cores are
    /// candidates, newest first. Each move is a request to the victim,
    /// which gives the task up only if it has not started it.
    pub(crate) fn balance(&mut self) {
        if !self.config.work_stealing || self.workers.len() < 2 {
            return;
        }

        let mut occupancy: HashMap<WorkerId, f64> = self
            .workers
            .values()
            .map(|w| (w.id.clone(), w.occupancy()))
            .collect();
        let average = occupancy.values().sum::<f64>() / occupancy.len() as f64;
        if average <= 0.0 {
            return;
        }

        let mut victims: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| w.occupancy() > average && w.processing.len() > w.ncores)
            .map(|w| w.id.clone())
            .collect();
        victims.sort_by(|a, b| occupancy[b].total_cmp(&occupancy[a]));

        let thieves: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| !w.paused && !victims.contains(&w.id))
            .filter(|w| w.occupancy() < average / 2.0 || w.free_cores() > 0)
            .map(|w| w.id.clone())
            .collect();
        if victims.is_empty() || thieves.is_empty() {
            return;
        }

        let mut budget = self.config.max_steals_per_tick;
        for victim in victims {
            let Some(record) = self.workers.get(&victim) else {
                continue;
            };
            let victim_cores = record.ncores as f64;
            let queued = record.processing.len().saturating_sub(record.ncores);
            let candidates: Vec<(TaskKey, f64)> = record
                .processing
                .iter()
                .rev()
                .take(queued)
                .filter(|(key, _)| self.is_stealable(key, &record.executing))
                .map(|(key, est)| (key.clone(), est.as_secs_f64()))
                .collect();

            for (key, estimate) in candidates {
                if budget == 0 {
                    return;
                }
                if occupancy[&victim] <= average {
                    break;
                }
                let Some(thief) = self.pick_thief(&key, &thieves, &occupancy) else {
                    continue;
                };
                let thief_cores = self.workers[&thief].ncores as f64;
                let victim_after = occupancy[&victim] - estimate / victim_cores;
                let thief_after = occupancy[&thief] + estimate / thief_cores;
                if thief_after >= victim_after + estimate / victim_cores {
                    continue;
                }

                if !self.send(&victim, SchedulerMessage::StealRequest { key: key.clone() }) {
                    return;
                }
                debug!(key = %key, victim = %victim, thief = %thief, "steal requested");
                self.steals.insert(
                    key,
                    InFlightSteal {
                        victim: victim.clone(),
                        thief: thief.clone(),
                    },
                );
                occupancy.insert(victim.clone(), victim_after);
                occupancy.insert(thief, thief_after);
                budget -= 1;
                self.with_metrics(|m| m.steals_requested += 1);
            }
        }
    }

    fn is_stealable(&self, key: &TaskKey, executing: &BTreeSet<TaskKey>) -> bool {
        !self.steals.contains_key(key)
            && !executing.contains(key)
            && self.tasks.get(key).is_some_and(|t| t.is_pure())
    }

    /// Allowed thief with the cheapest inputs to fetch, then the lowest
    /// occupancy.
    fn pick_thief(
        &self,
        key: &TaskKey,
        thieves: &[WorkerId],
        occupancy: &HashMap<WorkerId, f64>,
    ) -> Option<WorkerId> {
        let task = self.tasks.get(key)?;
        thieves
            .iter()
            .filter(|t| task.allows(t))
            .min_by(|a, b| {
                self.missing_bytes(key, a)
                    .cmp(&self.missing_bytes(key, b))
                    .then(occupancy[*a].total_cmp(&occupancy[*b]))
            })
            .cloned()
    }

    /// Second half of the steal handshake.
    pub(crate) fn steal_response(&mut self, victim: &WorkerId, key: &TaskKey, stolen: bool) {
        let Some(steal) = self.steals.remove(key) else {
            return;
        };
        if steal.victim != *victim || !stolen {
            debug!(key = %key, victim = %victim, "steal declined");
            return;
        }
        match self.tasks.get(key) {
            Some(task)
                if task.state == TaskState::Processing
                    && task.processing_on.as_ref() == Some(victim) => {}
            _ => return,
        }

        if let Some(record) = self.workers.get_mut(victim) {
            record.processing.shift_remove(key);
        }
        if let Some(task) = self.tasks.get_mut(key) {
            task.state = TaskState::Waiting;
            task.processing_on = None;
            task.started = None;
        }
        self.with_metrics(|m| m.steals_completed += 1);

        let thief_ok = self
            .workers
            .get(&steal.thief)
            .is_some_and(|w| !w.paused)
            && self.tasks.get(key).is_some_and(|t| t.allows(&steal.thief));
        if thief_ok {
            debug!(key = %key, victim = %victim, thief = %steal.thief, "task stolen");
            self.send_compute(key, &steal.thief);
        } else {
            self.ready.push_back(key.clone());
        }
    }
}
