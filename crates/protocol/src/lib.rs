pub mod error;
pub mod message;
pub mod messages;
pub mod network;
pub mod traits;

pub use error::TransportError;
pub use message::Message;
pub use messages::client::{ClientRequest, ClusterInfo, KeyOutcome, ScatteredKey, WorkerInfo};
pub use messages::data::{DataRequest, DataResponse};
pub use messages::scheduler::{ComputeRequest, SchedulerMessage};
pub use messages::worker::WorkerMessage;
pub use messages::SchedulerEvent;
pub use network::{LocalNetwork, SchedulerInbox, WorkerEndpoint, WorkerMailbox};
pub use traits::DataPlane;
