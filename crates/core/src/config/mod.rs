//! Cluster configuration, parsed from `tessera.toml`.
//!
//! Split into focused submodules:
//! - `types`: config structs and their defaults
//! - `loading`: TOML parsing, file loading, environment overrides
//! - `validation`: threshold ordering and interval sanity checks

mod loading;
mod types;
mod validation;

pub use types::{
    AdaptiveConfig, ClusterConfig, ClusterSection, MemoryThresholds, NannyConfig,
    SchedulerConfig, WorkerConfig,
};
