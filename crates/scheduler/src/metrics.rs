use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Scheduler operational counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Tasks completed, by function name.
    pub tasks_finished: HashMap<String, u64>,
    /// Average task duration by function name.
    pub avg_task_duration: HashMap<String, Duration>,
    /// Last completion time by function name.
    pub last_run: HashMap<String, DateTime<Utc>>,
    pub tasks_erred: u64,
    pub tasks_retried: u64,
    pub suspicious_tasks: u64,
    pub workers_registered: u64,
    pub workers_lost: u64,
    pub steals_requested: u64,
    pub steals_completed: u64,
    pub keys_forgotten: u64,
    pub release_leaks: u64,
}

impl SchedulerMetrics {
    /// Record a task completion.
    pub fn record_execution(&mut self, function: &str, duration: Duration) {
        *self.tasks_finished.entry(function.to_string()).or_default() += 1;
        self.last_run.insert(function.to_string(), Utc::now());

        let count = self.tasks_finished[function];
        let prev_avg = self
            .avg_task_duration
            .get(function)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };

        self.avg_task_duration.insert(function.to_string(), new_avg);
    }

    pub fn total_finished(&self) -> u64 {
        self.tasks_finished.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_single_execution() {
        let mut m = SchedulerMetrics::default();
        m.record_execution("inc", Duration::from_millis(100));

        assert_eq!(m.tasks_finished["inc"], 1);
        assert!(m.last_run.contains_key("inc"));
        assert_eq!(m.avg_task_duration["inc"], Duration::from_millis(100));
    }

    #[test]
    fn record_multiple_executions_averages() {
        let mut m = SchedulerMetrics::default();
        m.record_execution("inc", Duration::from_millis(100));
        m.record_execution("inc", Duration::from_millis(200));
        m.record_execution("dec", Duration::from_millis(5));

        assert_eq!(m.tasks_finished["inc"], 2);
        assert_eq!(m.total_finished(), 3);
        let avg = m.avg_task_duration["inc"].as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
    }
}
