use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration of a local cluster.
///
/// Parsed from `tessera.toml` with support for environment variable overrides.
/// Every field has a default, so an empty file is a valid config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub nanny: NannyConfig,

    #[serde(default)]
    pub adaptive: AdaptiveConfig,

    #[serde(default)]
    pub cluster: ClusterSection,
}

// ── Scheduler ───────────────────────────────────────────────────────

/// Scheduler timing and failure policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Expected interval between worker heartbeats.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Heartbeats a worker may miss before it is declared lost.
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
    #[serde(default = "default_true")]
    pub work_stealing: bool,
    #[serde(default = "default_steal_interval")]
    pub steal_interval_ms: u64,
    /// Upper bound on tasks moved per balancing pass.
    #[serde(default = "default_max_steals")]
    pub max_steals_per_tick: usize,
    #[serde(default = "default_gc_interval")]
    pub gc_interval_ms: u64,
    /// How long to wait for `keys-released` before logging a leak.
    #[serde(default = "default_release_timeout")]
    pub release_timeout_ms: u64,
    /// Worker deaths a task may witness before it is marked suspicious.
    #[serde(default = "default_allowed_failures")]
    pub allowed_failures: u32,
    /// Wall-clock limit per task. None = unlimited.
    #[serde(default)]
    pub task_timeout_ms: Option<u64>,
    /// Duration estimate for functions that never ran.
    #[serde(default = "default_unknown_duration")]
    pub unknown_task_duration_ms: u64,
    /// EWMA weight of the newest sample, in (0, 1].
    #[serde(default = "default_smoothing")]
    pub duration_smoothing: f64,
}

fn default_heartbeat_interval() -> u64 { 1000 }
fn default_missed_heartbeats() -> u32 { 3 }
fn default_true() -> bool { true }
fn default_steal_interval() -> u64 { 100 }
fn default_max_steals() -> usize { 16 }
fn default_gc_interval() -> u64 { 500 }
fn default_release_timeout() -> u64 { 5000 }
fn default_allowed_failures() -> u32 { 3 }
fn default_unknown_duration() -> u64 { 500 }
fn default_smoothing() -> f64 { 0.5 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval(),
            missed_heartbeats: default_missed_heartbeats(),
            work_stealing: default_true(),
            steal_interval_ms: default_steal_interval(),
            max_steals_per_tick: default_max_steals(),
            gc_interval_ms: default_gc_interval(),
            release_timeout_ms: default_release_timeout(),
            allowed_failures: default_allowed_failures(),
            task_timeout_ms: None,
            unknown_task_duration_ms: default_unknown_duration(),
            duration_smoothing: default_smoothing(),
        }
    }
}

impl SchedulerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence after which a worker counts as dead.
    pub fn worker_ttl(&self) -> Duration {
        self.heartbeat_interval() * self.missed_heartbeats
    }

    pub fn steal_interval(&self) -> Duration {
        Duration::from_millis(self.steal_interval_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    pub fn unknown_task_duration(&self) -> Duration {
        Duration::from_millis(self.unknown_task_duration_ms)
    }
}

// ── Worker ──────────────────────────────────────────────────────────

/// Fractions of `memory_limit` that trigger each memory-pressure action.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryThresholds {
    /// Start spilling least-recently-used results.
    #[serde(default = "default_target")]
    pub target: f64,
    /// Spill largest results first, regardless of recency.
    #[serde(default = "default_spill")]
    pub spill: f64,
    /// Stop starting new tasks.
    #[serde(default = "default_pause")]
    pub pause: f64,
    /// Shut the worker down so its nanny restarts it.
    #[serde(default = "default_terminate")]
    pub terminate: f64,
}

fn default_target() -> f64 { 0.60 }
fn default_spill() -> f64 { 0.70 }
fn default_pause() -> f64 { 0.80 }
fn default_terminate() -> f64 { 0.95 }

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            target: default_target(),
            spill: default_spill(),
            pause: default_pause(),
            terminate: default_terminate(),
        }
    }
}

/// Per-worker resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Execution threads. 0 = available parallelism.
    #[serde(default)]
    pub nthreads: usize,
    /// Memory budget in bytes for results held in memory.
    #[serde(default = "default_memory_limit")]
    pub memory_limit: u64,
    /// Parent directory for spill files. None = system temp dir.
    #[serde(default)]
    pub local_directory: Option<PathBuf>,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    #[serde(default)]
    pub memory: MemoryThresholds,
}

fn default_memory_limit() -> u64 { 2 * 1024 * 1024 * 1024 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            nthreads: 0,
            memory_limit: default_memory_limit(),
            local_directory: None,
            heartbeat_interval_ms: default_heartbeat_interval(),
            memory: MemoryThresholds::default(),
        }
    }
}

impl WorkerConfig {
    /// Resolve thread count (0 means use available parallelism).
    pub fn resolved_nthreads(&self) -> usize {
        if self.nthreads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.nthreads
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Directory spill files for one worker live in.
    pub fn spill_directory(&self, worker: &str) -> PathBuf {
        self.local_directory
            .clone()
            .unwrap_or_else(std::env::temp_dir)
            .join("tessera-spill")
            .join(worker)
    }
}

// ── Nanny ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NannyConfig {
    /// Consecutive crashes within `restart_window_ms` before giving up.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_window")]
    pub restart_window_ms: u64,
}

fn default_max_restarts() -> u32 { 10 }
fn default_restart_window() -> u64 { 60_000 }

impl Default for NannyConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            restart_window_ms: default_restart_window(),
        }
    }
}

impl NannyConfig {
    pub fn restart_window(&self) -> Duration {
        Duration::from_millis(self.restart_window_ms)
    }
}

// ── Adaptive scaling ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_minimum")]
    pub minimum: usize,
    #[serde(default = "default_maximum")]
    pub maximum: usize,
    /// Queued work should drain within this much wall-clock time.
    #[serde(default = "default_target_duration")]
    pub target_duration_ms: u64,
    #[serde(default = "default_adaptive_interval")]
    pub interval_ms: u64,
}

fn default_minimum() -> usize { 1 }
fn default_maximum() -> usize { 8 }
fn default_target_duration() -> u64 { 5000 }
fn default_adaptive_interval() -> u64 { 1000 }

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            minimum: default_minimum(),
            maximum: default_maximum(),
            target_duration_ms: default_target_duration(),
            interval_ms: default_adaptive_interval(),
        }
    }
}

impl AdaptiveConfig {
    pub fn target_duration(&self) -> Duration {
        Duration::from_millis(self.target_duration_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// ── Cluster ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    /// Workers started by `LocalCluster::start`.
    #[serde(default = "default_n_workers")]
    pub n_workers: usize,
}

fn default_n_workers() -> usize { 4 }

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            n_workers: default_n_workers(),
        }
    }
}
