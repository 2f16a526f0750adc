//! A whole tessera cluster inside one process.
//!
//! [`LocalCluster`] starts the scheduler and a pool of nanny-supervised
//! workers, can resize the pool by hand or adaptively, and exposes kill
//! hooks for fault-injection tests.

mod adaptive;
pub mod builtins;
pub mod cluster;
pub mod error;
mod pool;

pub use cluster::LocalCluster;
pub use error::ClusterError;
