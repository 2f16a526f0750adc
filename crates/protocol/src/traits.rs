use std::sync::Arc;

use async_trait::async_trait;

use tessera_core::{Blob, TaskKey, WorkerId};

use crate::error::TransportError;
use crate::messages::data::DataResponse;

/// Direct key transfer to and from worker stores.
///
/// Workers fetch dependencies from peers through this, and clients gather
/// results and scatter data through it. The scheduler is never on the path.
#[async_trait]
pub trait DataPlane: Send + Sync {
    /// Read `keys` from `worker`. Keys it does not hold come back in
    /// [`DataResponse::missing`].
    async fn get_data(
        &self,
        worker: &WorkerId,
        keys: Vec<TaskKey>,
    ) -> Result<DataResponse, TransportError>;

    /// Write values into `worker`'s store.
    async fn put_data(
        &self,
        worker: &WorkerId,
        entries: Vec<(TaskKey, Blob)>,
    ) -> Result<(), TransportError>;
}

/// Blanket implementation so `Arc<dyn DataPlane>` can be used directly.
#[async_trait]
impl<T: DataPlane + ?Sized> DataPlane for Arc<T> {
    async fn get_data(
        &self,
        worker: &WorkerId,
        keys: Vec<TaskKey>,
    ) -> Result<DataResponse, TransportError> {
        (**self).get_data(worker, keys).await
    }

    async fn put_data(
        &self,
        worker: &WorkerId,
        entries: Vec<(TaskKey, Blob)>,
    ) -> Result<(), TransportError> {
        (**self).put_data(worker, entries).await
    }
}
