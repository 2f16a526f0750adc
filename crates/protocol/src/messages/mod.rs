//! Logical message contracts between cluster components.
//!
//! - **Worker messages** (`worker`): worker → scheduler status and heartbeats
//! - **Scheduler messages** (`scheduler`): scheduler → worker instructions
//! - **Client requests** (`client`): client → scheduler, answered over oneshots
//! - **Data requests** (`data`): direct key transfer on the data plane

pub mod client;
pub mod data;
pub mod scheduler;
pub mod worker;

use crate::message::Message;

use self::client::ClientRequest;

/// Everything the scheduler's event loop can receive.
#[derive(Debug)]
pub enum SchedulerEvent {
    /// An encoded [`WorkerMessage`](worker::WorkerMessage).
    Worker(Message),
    Client(ClientRequest),
}
