use std::future::Future;
use std::time::Duration;

use futures::future::{try_join_all, BoxFuture};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};

use tessera_protocol::KeyOutcome;

use crate::error::ClientError;
use crate::future::TaskFuture;

/// When [`wait`] returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReturnWhen {
    #[default]
    AllCompleted,
    FirstCompleted,
}

/// Futures split by whether they have finished.
#[derive(Debug, Default)]
pub struct DoneAndNotDone {
    pub done: Vec<TaskFuture>,
    pub not_done: Vec<TaskFuture>,
}

async fn within<F: Future>(timeout: Option<Duration>, fut: F) -> Result<F::Output, ClientError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ClientError::Timeout(limit)),
        None => Ok(fut.await),
    }
}

/// Block until all (or the first of) `futures` finish.
///
/// A failed or cancelled task counts as finished. Running past `timeout`
/// returns [`ClientError::Timeout`].
pub async fn wait(
    futures: &[TaskFuture],
    timeout: Option<Duration>,
    return_when: ReturnWhen,
) -> Result<DoneAndNotDone, ClientError> {
    match return_when {
        ReturnWhen::AllCompleted => {
            within(timeout, try_join_all(futures.iter().map(|f| f.outcome()))).await??;
            Ok(DoneAndNotDone {
                done: futures.to_vec(),
                not_done: Vec::new(),
            })
        }
        ReturnWhen::FirstCompleted => {
            if futures.is_empty() {
                return Ok(DoneAndNotDone::default());
            }
            let mut pending: FuturesUnordered<_> = futures
                .iter()
                .enumerate()
                .map(|(i, f)| f.outcome().map(move |outcome| (i, outcome)))
                .collect();
            let first = within(timeout, pending.next()).await?;
            drop(pending);
            let first = match first {
                Some((i, outcome)) => {
                    outcome?;
                    i
                }
                None => return Ok(DoneAndNotDone::default()),
            };

            let mut split = DoneAndNotDone::default();
            for (i, future) in futures.iter().enumerate() {
                if i == first || future.done().await? {
                    split.done.push(future.clone());
                } else {
                    split.not_done.push(future.clone());
                }
            }
            Ok(split)
        }
    }
}

type Pending = BoxFuture<'static, (TaskFuture, Result<KeyOutcome, ClientError>)>;

/// Yields futures in the order they finish, not the order they were added.
pub struct AsCompleted {
    pending: FuturesUnordered<Pending>,
}

impl AsCompleted {
    pub fn new(futures: impl IntoIterator<Item = TaskFuture>) -> Self {
        let mut this = Self {
            pending: FuturesUnordered::new(),
        };
        for future in futures {
            this.add(future);
        }
        this
    }

    /// Track one more future.
    pub fn add(&mut self, future: TaskFuture) {
        self.pending.push(
            async move {
                let outcome = future.outcome().await;
                (future, outcome)
            }
            .boxed(),
        );
    }

    /// The next future to finish, with how it finished.
    pub async fn next_with_outcome(
        &mut self,
    ) -> Option<(TaskFuture, Result<KeyOutcome, ClientError>)> {
        self.pending.next().await
    }

    /// The next future to finish, or `None` once all have been yielded.
    pub async fn next(&mut self) -> Option<TaskFuture> {
        self.next_with_outcome().await.map(|(future, _)| future)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
