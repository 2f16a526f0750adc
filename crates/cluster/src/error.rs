use thiserror::Error;

use tessera_client::ClientError;
use tessera_core::ConfigError;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("scheduler is gone")]
    SchedulerClosed,
}
