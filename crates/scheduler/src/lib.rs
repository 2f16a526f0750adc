//! Central task scheduler.
//!
//! A single actor owns every task and worker record and processes worker
//! reports and client requests one at a time. Placement prefers workers that
//! already hold a task's inputs, idle workers steal queued work from busy
//! ones, and lost workers have their tasks and data recomputed.

pub mod duration;
pub mod metrics;
pub mod records;
pub mod runner;

pub use duration::DurationEstimator;
pub use metrics::SchedulerMetrics;
pub use records::{TaskRecord, WorkerRecord};
pub use runner::{Scheduler, SchedulerState};
