use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::ConfigError;

use super::types::ClusterConfig;

impl ClusterConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Small, fast-ticking config for tests and demos.
    pub fn local(n_workers: usize) -> Self {
        let mut config = Self::default();
        config.cluster.n_workers = n_workers;
        config.worker.nthreads = 2;
        config.worker.heartbeat_interval_ms = 50;
        config.scheduler.heartbeat_interval_ms = 100;
        config.scheduler.steal_interval_ms = 50;
        config.scheduler.gc_interval_ms = 50;
        config.scheduler.release_timeout_ms = 1000;
        config.nanny.restart_window_ms = 10_000;
        config
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `TESSERA_SECTION_KEY` overrides `section.key`.
    /// Examples:
    /// - `TESSERA_CLUSTER_N_WORKERS` -> `cluster.n_workers`
    /// - `TESSERA_WORKER_MEMORY_LIMIT` -> `worker.memory_limit`
    /// - `TESSERA_SCHEDULER_TASK_TIMEOUT_MS` -> `scheduler.task_timeout_ms`
    pub(crate) fn apply_env_overrides(&mut self) {
        override_parsed("TESSERA_CLUSTER_N_WORKERS", &mut self.cluster.n_workers);

        override_parsed("TESSERA_WORKER_NTHREADS", &mut self.worker.nthreads);
        override_parsed("TESSERA_WORKER_MEMORY_LIMIT", &mut self.worker.memory_limit);
        override_parsed(
            "TESSERA_WORKER_HEARTBEAT_INTERVAL_MS",
            &mut self.worker.heartbeat_interval_ms,
        );
        if let Ok(v) = std::env::var("TESSERA_WORKER_LOCAL_DIRECTORY") {
            self.worker.local_directory = Some(PathBuf::from(v));
        }

        override_parsed(
            "TESSERA_SCHEDULER_HEARTBEAT_INTERVAL_MS",
            &mut self.scheduler.heartbeat_interval_ms,
        );
        override_parsed(
            "TESSERA_SCHEDULER_MISSED_HEARTBEATS",
            &mut self.scheduler.missed_heartbeats,
        );
        override_parsed("TESSERA_SCHEDULER_WORK_STEALING", &mut self.scheduler.work_stealing);
        override_parsed(
            "TESSERA_SCHEDULER_STEAL_INTERVAL_MS",
            &mut self.scheduler.steal_interval_ms,
        );
        override_parsed("TESSERA_SCHEDULER_GC_INTERVAL_MS", &mut self.scheduler.gc_interval_ms);
        override_parsed(
            "TESSERA_SCHEDULER_ALLOWED_FAILURES",
            &mut self.scheduler.allowed_failures,
        );
        if let Ok(v) = std::env::var("TESSERA_SCHEDULER_TASK_TIMEOUT_MS") {
            match v.parse::<u64>() {
                Ok(ms) => self.scheduler.task_timeout_ms = Some(ms),
                Err(_) => warn!(value = %v, "ignoring unparsable TESSERA_SCHEDULER_TASK_TIMEOUT_MS"),
            }
        }

        override_parsed("TESSERA_ADAPTIVE_ENABLED", &mut self.adaptive.enabled);
        override_parsed("TESSERA_ADAPTIVE_MINIMUM", &mut self.adaptive.minimum);
        override_parsed("TESSERA_ADAPTIVE_MAXIMUM", &mut self.adaptive.maximum);
    }
}

fn override_parsed<T: std::str::FromStr>(var: &str, slot: &mut T) {
    if let Ok(v) = std::env::var(var) {
        match v.parse::<T>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => warn!(var, value = %v, "ignoring unparsable config override"),
        }
    }
}
