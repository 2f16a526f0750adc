use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::debug;

use tessera_core::{Blob, FunctionError, TaskFn, TaskInputs, TaskKey};

use crate::error::WorkerError;

/// How one execution ended.
#[derive(Debug)]
pub enum Outcome {
    Finished(Blob),
    Failed(FunctionError),
    /// The function panicked. The worker cannot be trusted after this.
    Panicked(String),
}

/// Result of one task run, sent back to the worker loop.
#[derive(Debug)]
pub struct Execution {
    pub key: TaskKey,
    pub outcome: Outcome,
    pub duration: Duration,
    /// Input bytes that were reserved for the run.
    pub reserved: u64,
}

/// Fixed-size rayon pool that reports results over a channel.
pub struct ExecutionPool {
    pool: rayon::ThreadPool,
    results: mpsc::UnboundedSender<Execution>,
}

impl ExecutionPool {
    pub fn new(
        nthreads: usize,
        name: &str,
        results: mpsc::UnboundedSender<Execution>,
    ) -> Result<Self, WorkerError> {
        let prefix = name.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(nthreads.max(1))
            .thread_name(move |i| format!("{prefix}-exec-{i}"))
            .build()?;
        Ok(Self { pool, results })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `function` on the pool. The result arrives on the results channel.
    pub fn spawn(&self, key: TaskKey, function: TaskFn, inputs: TaskInputs, reserved: u64) {
        let results = self.results.clone();
        self.pool.spawn(move || {
            let start = Instant::now();
            let outcome = match catch_unwind(AssertUnwindSafe(|| function(&inputs))) {
                Ok(Ok(blob)) => Outcome::Finished(blob),
                Ok(Err(e)) => Outcome::Failed(e),
                Err(payload) => Outcome::Panicked(panic_message(payload.as_ref())),
            };
            let duration = start.elapsed();
            debug!(key = %key, ?duration, "execution done");
            // The worker may already be gone.
            let _ = results.send(Execution {
                key,
                outcome,
                duration,
                reserved,
            });
        });
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
