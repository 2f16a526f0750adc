//! Scheduler actor.
//!
//! Split into focused submodules:
//! - `core`: state struct, event loop and message dispatch
//! - `graph`: graph updates, client references and cancellation
//! - `transitions`: task completion, errors, recomputation and forgetting
//! - `placement`: worker selection and scatter targets
//! - `stealing`: occupancy-based work stealing
//! - `recovery`: worker loss, missing data, heartbeats and timeouts
//! - `gc`: release of unreferenced keys
//! - `queries`: read-only client queries and the adaptive target

mod core;
mod gc;
mod graph;
mod placement;
mod queries;
mod recovery;
mod stealing;
mod transitions;
#[cfg(test)]
mod tests;

pub use self::core::{Scheduler, SchedulerState};
