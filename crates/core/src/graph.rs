//! Lazy task graphs and the [`Call`] builder used to describe one task.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;

use crate::blob::Blob;
use crate::error::GraphError;
use crate::key::{TaskKey, WorkerId};
use crate::task::{Arg, TaskSpec};

/// Builder for a single task.
///
/// Encoding errors are remembered and reported by [`Call::build`], so a bad
/// argument fails the submission before anything reaches the scheduler.
///
/// ```ignore
/// let call = Call::new("add").arg(&1i64).dep(a.key().clone()).retries(2);
/// ```
#[derive(Debug)]
pub struct Call {
    spec: TaskSpec,
    key: Option<TaskKey>,
    error: Option<GraphError>,
}

impl Call {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            spec: TaskSpec::new(function),
            key: None,
            error: None,
        }
    }

    /// Append a literal positional argument.
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match Blob::encode(value) {
            Ok(blob) => self.spec.args.push(Arg::Literal(blob)),
            Err(source) => self.record_error(source),
        }
        self
    }

    /// Append an already-encoded positional argument.
    pub fn arg_blob(mut self, blob: Blob) -> Self {
        self.spec.args.push(Arg::Literal(blob));
        self
    }

    /// Append a positional argument that is the result of another task.
    pub fn dep(mut self, key: impl Into<TaskKey>) -> Self {
        self.spec.args.push(Arg::Key(key.into()));
        self
    }

    pub fn kwarg<T: Serialize + ?Sized>(mut self, name: impl Into<String>, value: &T) -> Self {
        match Blob::encode(value) {
            Ok(blob) => {
                self.spec.kwargs.insert(name.into(), Arg::Literal(blob));
            }
            Err(source) => self.record_error(source),
        }
        self
    }

    pub fn kwarg_dep(mut self, name: impl Into<String>, key: impl Into<TaskKey>) -> Self {
        self.spec.kwargs.insert(name.into(), Arg::Key(key.into()));
        self
    }

    /// `pure(false)` gives every submission a fresh random key.
    pub fn pure(mut self, pure: bool) -> Self {
        self.spec.pure = pure;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.spec.retries = retries;
        self
    }

    /// Only run on the given workers.
    pub fn workers(mut self, workers: Vec<WorkerId>) -> Self {
        self.spec.workers = Some(workers);
        self
    }

    /// Use an explicit key instead of a derived one.
    pub fn key(mut self, key: impl Into<TaskKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn function(&self) -> &str {
        &self.spec.function
    }

    pub fn dependencies(&self) -> BTreeSet<TaskKey> {
        self.spec.dependencies()
    }

    fn record_error(&mut self, source: rmp_serde::encode::Error) {
        if self.error.is_none() {
            self.error = Some(GraphError::Serialization {
                function: self.spec.function.clone(),
                source,
            });
        }
    }

    /// Validate the call and resolve its key.
    pub fn build(self) -> Result<(TaskKey, TaskSpec), GraphError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.spec.function.is_empty() {
            return Err(GraphError::EmptyFunction);
        }
        let key = match self.key {
            Some(key) => key,
            None if self.spec.pure => {
                let content = rmp_serde::to_vec(&(&self.spec.args, &self.spec.kwargs)).map_err(
                    |source| GraphError::Serialization {
                        function: self.spec.function.clone(),
                        source,
                    },
                )?;
                TaskKey::fingerprint(&self.spec.function, &content)
            }
            None => TaskKey::random(&self.spec.function),
        };
        if self.spec.dependencies().contains(&key) {
            return Err(GraphError::Cycle(key.to_string()));
        }
        Ok((key, self.spec))
    }
}

/// An immutable-once-submitted set of tasks and their dependency edges.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: BTreeMap<TaskKey, TaskSpec>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task. Adding the same pure task twice is a no-op.
    pub fn add(&mut self, call: Call) -> Result<TaskKey, GraphError> {
        let (key, spec) = call.build()?;
        match self.tasks.get(&key) {
            Some(existing) if *existing == spec => Ok(key),
            Some(_) => Err(GraphError::DuplicateKey(key)),
            None => {
                self.tasks.insert(key.clone(), spec);
                Ok(key)
            }
        }
    }

    /// Add an already-built task under an explicit key.
    pub fn insert(&mut self, key: TaskKey, spec: TaskSpec) -> Result<(), GraphError> {
        if spec.function.is_empty() {
            return Err(GraphError::EmptyFunction);
        }
        match self.tasks.get(&key) {
            Some(existing) if *existing == spec => Ok(()),
            Some(_) => Err(GraphError::DuplicateKey(key)),
            None => {
                self.tasks.insert(key, spec);
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &TaskKey) -> Option<&TaskSpec> {
        self.tasks.get(key)
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TaskKey> {
        self.tasks.keys()
    }

    /// Dependencies that are not defined inside this graph.
    pub fn external_dependencies(&self) -> BTreeSet<TaskKey> {
        self.tasks
            .values()
            .flat_map(TaskSpec::dependencies)
            .filter(|dep| !self.tasks.contains_key(dep))
            .collect()
    }

    /// Keys no other task in the graph depends on.
    pub fn outputs(&self) -> Vec<TaskKey> {
        let consumed: BTreeSet<TaskKey> =
            self.tasks.values().flat_map(TaskSpec::dependencies).collect();
        self.tasks
            .keys()
            .filter(|k| !consumed.contains(*k))
            .cloned()
            .collect()
    }

    /// Keys in dependency order (Kahn's algorithm), or a cycle error.
    pub fn topological_order(&self) -> Result<Vec<TaskKey>, GraphError> {
        let mut in_degree: BTreeMap<&TaskKey, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&TaskKey, Vec<&TaskKey>> = BTreeMap::new();

        for key in self.tasks.keys() {
            in_degree.entry(key).or_insert(0);
        }
        for (key, spec) in &self.tasks {
            for dep in spec.args.iter().chain(spec.kwargs.values()).filter_map(Arg::as_key) {
                if let Some((dep_key, _)) = self.tasks.get_key_value(dep) {
                    dependents.entry(dep_key).or_default().push(key);
                    *in_degree.entry(key).or_insert(0) += 1;
                }
            }
        }

        let mut queue: VecDeque<&TaskKey> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&key, _)| key)
            .collect();
        let mut sorted = Vec::with_capacity(self.tasks.len());

        while let Some(node) = queue.pop_front() {
            sorted.push(node.clone());
            for &next in dependents.get(node).into_iter().flatten() {
                if let Some(deg) = in_degree.get_mut(next) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        if sorted.len() != self.tasks.len() {
            let in_cycle: Vec<&str> = in_degree
                .iter()
                .filter(|(_, &deg)| deg > 0)
                .map(|(key, _)| key.as_str())
                .collect();
            return Err(GraphError::Cycle(in_cycle.join(" -> ")));
        }
        Ok(sorted)
    }

    /// Consume the graph, yielding tasks in dependency order.
    pub fn into_ordered_tasks(mut self) -> Result<Vec<(TaskKey, TaskSpec)>, GraphError> {
        let order = self.topological_order()?;
        Ok(order
            .into_iter()
            .filter_map(|key| self.tasks.remove(&key).map(|spec| (key, spec)))
            .collect())
    }
}
