pub mod blob;
pub mod config;
pub mod error;
pub mod failure;
pub mod graph;
pub mod key;
pub mod registry;
pub mod task;

pub use blob::Blob;
pub use config::{
    AdaptiveConfig, ClusterConfig, ClusterSection, MemoryThresholds, NannyConfig,
    SchedulerConfig, WorkerConfig,
};
pub use error::{ConfigError, GraphError};
pub use failure::{FailureKind, TaskFailure};
pub use graph::{Call, TaskGraph};
pub use key::{ClientId, TaskKey, WorkerId};
pub use registry::{FunctionError, FunctionRegistry, TaskFn, TaskInputs};
pub use task::{Arg, TaskSpec, TaskState};
