//! Named user functions that workers can execute.
//!
//! Task specs refer to functions by name only, so a graph stays plain data
//! that can cross any message boundary. Every worker in a cluster holds the
//! same [`FunctionRegistry`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::blob::Blob;

/// Error returned by a user function. Becomes a `task-error` failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{exception}: {message}")]
pub struct FunctionError {
    pub exception: String,
    pub message: String,
}

impl FunctionError {
    pub fn new(exception: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception: exception.into(),
            message: message.into(),
        }
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }
}

/// Resolved inputs of a task: literals decoded from the task arguments and
/// dependency results fetched from the store, in argument order.
#[derive(Debug, Clone, Default)]
pub struct TaskInputs {
    pub args: Vec<Blob>,
    pub kwargs: BTreeMap<String, Blob>,
}

impl TaskInputs {
    /// Decode positional argument `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, FunctionError> {
        let blob = self.args.get(index).ok_or_else(|| {
            FunctionError::new(
                "IndexError",
                format!("expected at least {} arguments, got {}", index + 1, self.args.len()),
            )
        })?;
        blob.decode()
            .map_err(|e| FunctionError::type_error(format!("argument {index}: {e}")))
    }

    /// Decode keyword argument `name`, if it was passed.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, FunctionError> {
        self.kwargs
            .get(name)
            .map(|blob| {
                blob.decode()
                    .map_err(|e| FunctionError::type_error(format!("keyword {name}: {e}")))
            })
            .transpose()
    }
}

/// Type-erased task function.
pub type TaskFn = Arc<dyn Fn(&TaskInputs) -> Result<Blob, FunctionError> + Send + Sync>;

fn encode_output<R: Serialize>(value: &R) -> Result<Blob, FunctionError> {
    Blob::encode(value).map_err(|e| FunctionError::new("SerializationError", e.to_string()))
}

/// Name → function table shared by every worker.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, TaskFn>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function that works on raw inputs.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&TaskInputs) -> Result<Blob, FunctionError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(f));
        self
    }

    /// Register a nullary function.
    pub fn register_fn0<R, F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        R: Serialize,
        F: Fn() -> Result<R, FunctionError> + Send + Sync + 'static,
    {
        self.register(name, move |_inputs: &TaskInputs| encode_output(&f()?))
    }

    /// Register a one-argument function with typed input and output.
    pub fn register_fn1<A, R, F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> Result<R, FunctionError> + Send + Sync + 'static,
    {
        self.register(name, move |inputs: &TaskInputs| {
            encode_output(&f(inputs.arg(0)?)?)
        })
    }

    /// Register a two-argument function with typed inputs and output.
    pub fn register_fn2<A, B, R, F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        A: DeserializeOwned,
        B: DeserializeOwned,
        R: Serialize,
        F: Fn(A, B) -> Result<R, FunctionError> + Send + Sync + 'static,
    {
        self.register(name, move |inputs: &TaskInputs| {
            encode_output(&f(inputs.arg(0)?, inputs.arg(1)?)?)
        })
    }

    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("FunctionRegistry").field("functions", &names).finish()
    }
}
