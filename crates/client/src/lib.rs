//! Client side of a tessera cluster.
//!
//! A [`Client`] submits work to the scheduler and hands back
//! [`TaskFuture`]s. Results move straight between workers and the client;
//! the scheduler only tracks where they live.

pub mod client;
pub mod error;
pub mod future;
pub mod refs;
pub mod wait;

pub use client::Client;
pub use error::ClientError;
pub use future::TaskFuture;
pub use wait::{wait, AsCompleted, DoneAndNotDone, ReturnWhen};
