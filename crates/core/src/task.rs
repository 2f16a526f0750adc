use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::blob::Blob;
use crate::key::{TaskKey, WorkerId};

/// A task argument: either embedded data or the result of another task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arg {
    Literal(Blob),
    Key(TaskKey),
}

impl Arg {
    pub fn as_key(&self) -> Option<&TaskKey> {
        match self {
            Self::Key(k) => Some(k),
            Self::Literal(_) => None,
        }
    }
}

/// Recipe for computing one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Name the function is registered under in the workers' registry.
    pub function: String,
    pub args: Vec<Arg>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, Arg>,
    /// Pure tasks may be deduplicated and stolen.
    #[serde(default = "default_pure")]
    pub pure: bool,
    /// How many times a task error is retried before it sticks.
    #[serde(default)]
    pub retries: u32,
    /// Restrict placement to these workers.
    #[serde(default)]
    pub workers: Option<Vec<WorkerId>>,
}

fn default_pure() -> bool {
    true
}

impl TaskSpec {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            pure: true,
            retries: 0,
            workers: None,
        }
    }

    /// Keys of every task this one reads.
    pub fn dependencies(&self) -> BTreeSet<TaskKey> {
        self.args
            .iter()
            .chain(self.kwargs.values())
            .filter_map(Arg::as_key)
            .cloned()
            .collect()
    }
}

/// Scheduler-side lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Some dependency is not in memory yet.
    Pending,
    /// Ready to run, not yet placed on a worker.
    Waiting,
    /// Assigned to exactly one worker.
    Processing,
    /// Result held by at least one worker.
    Memory,
    Error,
    /// Data dropped; the record survives as a recipe for dependents.
    Released,
}

impl TaskState {
    /// States a waiter can be woken up with.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Memory | Self::Error)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Memory => "memory",
            Self::Error => "error",
            Self::Released => "released",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependencies_cover_args_and_kwargs() {
        let mut spec = TaskSpec::new("add");
        spec.args.push(Arg::Key("a".into()));
        spec.args.push(Arg::Literal(Blob::encode(&1i64).unwrap()));
        spec.kwargs.insert("other".into(), Arg::Key("b".into()));
        spec.kwargs.insert("again".into(), Arg::Key("a".into()));

        let deps: Vec<_> = spec.dependencies().into_iter().collect();
        assert_eq!(deps, vec![TaskKey::from("a"), TaskKey::from("b")]);
    }

    #[test]
    fn finished_states() {
        assert!(TaskState::Memory.is_finished());
        assert!(TaskState::Error.is_finished());
        assert!(!TaskState::Processing.is_finished());
        assert!(!TaskState::Released.is_finished());
    }
}
