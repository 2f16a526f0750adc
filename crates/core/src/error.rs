use thiserror::Error;

use crate::key::TaskKey;

/// A submission that can never be scheduled. Raised before anything is sent.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("argument of {function} could not be serialized: {source}")]
    Serialization {
        function: String,
        #[source]
        source: rmp_serde::encode::Error,
    },

    #[error("function name must not be empty")]
    EmptyFunction,

    #[error("cycle detected among tasks: {0}")]
    Cycle(String),

    #[error("task {task} depends on unknown key {dependency}")]
    UnknownDependency { task: TaskKey, dependency: TaskKey },

    #[error("key {0} is defined twice")]
    DuplicateKey(TaskKey),
}

/// Errors raised while loading or validating [`ClusterConfig`](crate::ClusterConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
