//! Task execution for tessera.
//!
//! A [`Worker`] owns a [`DataStore`] of results and a rayon
//! [`ExecutionPool`]. Its event loop takes compute instructions from the
//! scheduler, fetches dependencies straight from peers, and answers peer
//! and client data requests. A [`Nanny`] keeps one worker slot alive across
//! crashes and restarts.

pub mod error;
pub mod execution;
pub mod nanny;
pub mod store;
pub mod worker;

pub use error::WorkerError;
pub use execution::{Execution, ExecutionPool, Outcome};
pub use nanny::Nanny;
pub use store::{DataStore, MemoryPressure};
pub use worker::{Worker, WorkerExit};
