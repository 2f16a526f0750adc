use crate::error::ConfigError;

use super::types::ClusterConfig;

impl ClusterConfig {
    /// Validate the config: threshold ordering, non-zero intervals, sane bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_memory_thresholds()?;
        self.validate_intervals()?;
        self.validate_adaptive_bounds()?;
        Ok(())
    }

    /// Thresholds must be strictly increasing and within (0, 1].
    fn validate_memory_thresholds(&self) -> Result<(), ConfigError> {
        let m = &self.worker.memory;
        let ordered = 0.0 < m.target && m.target < m.spill && m.spill < m.pause
            && m.pause < m.terminate
            && m.terminate <= 1.0;
        if !ordered {
            return Err(ConfigError::Invalid(format!(
                "memory thresholds must satisfy 0 < target < spill < pause < terminate <= 1, \
                 got {}/{}/{}/{}",
                m.target, m.spill, m.pause, m.terminate
            )));
        }
        if self.worker.memory_limit == 0 {
            return Err(ConfigError::Invalid("worker.memory_limit must be > 0".into()));
        }
        Ok(())
    }

    fn validate_intervals(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        let checks = [
            ("scheduler.heartbeat_interval_ms", s.heartbeat_interval_ms),
            ("scheduler.steal_interval_ms", s.steal_interval_ms),
            ("scheduler.gc_interval_ms", s.gc_interval_ms),
            ("worker.heartbeat_interval_ms", self.worker.heartbeat_interval_ms),
            ("adaptive.interval_ms", self.adaptive.interval_ms),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }
        if s.missed_heartbeats == 0 {
            return Err(ConfigError::Invalid("scheduler.missed_heartbeats must be > 0".into()));
        }
        if self.worker.heartbeat_interval() >= s.worker_ttl() {
            return Err(ConfigError::Invalid(format!(
                "worker.heartbeat_interval_ms ({}) must be below the scheduler's worker ttl \
                 ({} ms = heartbeat_interval_ms x missed_heartbeats)",
                self.worker.heartbeat_interval_ms,
                s.worker_ttl().as_millis()
            )));
        }
        if s.allowed_failures == 0 {
            return Err(ConfigError::Invalid("scheduler.allowed_failures must be > 0".into()));
        }
        if !(s.duration_smoothing > 0.0 && s.duration_smoothing <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "scheduler.duration_smoothing must be in (0, 1], got {}",
                s.duration_smoothing
            )));
        }
        Ok(())
    }

    fn validate_adaptive_bounds(&self) -> Result<(), ConfigError> {
        let a = &self.adaptive;
        if a.minimum > a.maximum {
            return Err(ConfigError::Invalid(format!(
                "adaptive.minimum ({}) exceeds adaptive.maximum ({})",
                a.minimum, a.maximum
            )));
        }
        Ok(())
    }
}
