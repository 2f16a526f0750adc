use std::path::PathBuf;

use thiserror::Error;

use tessera_core::TaskKey;
use tessera_protocol::TransportError;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("spill I/O error at {path}: {source}")]
    Spill {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("spill encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("spill decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("task {key} crashed the worker: {message}")]
    TaskCrashed { key: TaskKey, message: String },

    #[error("memory limit exceeded: {used} of {limit} bytes in use")]
    MemoryLimit { used: u64, limit: u64 },

    #[error("thread pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
