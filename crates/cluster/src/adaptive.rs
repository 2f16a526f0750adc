use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use tessera_core::AdaptiveConfig;
use tessera_protocol::{ClientRequest, ClusterInfo, SchedulerEvent, SchedulerInbox};

use crate::error::ClusterError;
use crate::pool::WorkerPool;

pub(crate) async fn ask<T>(
    scheduler: &SchedulerInbox,
    build: impl FnOnce(oneshot::Sender<T>) -> ClientRequest,
) -> Result<T, ClusterError> {
    let (reply, rx) = oneshot::channel();
    scheduler
        .send(SchedulerEvent::Client(build(reply)))
        .map_err(|_| ClusterError::SchedulerClosed)?;
    rx.await.map_err(|_| ClusterError::SchedulerClosed)
}

/// Resize the pool toward the worker count the scheduler asks for.
///
/// The scheduler sizes the cluster so queued work drains within
/// `target_duration`, clamped to `[minimum, maximum]`.
pub(crate) async fn run(config: AdaptiveConfig, pool: Arc<WorkerPool>, scheduler: SchedulerInbox) {
    let mut tick = interval(config.interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        minimum = config.minimum,
        maximum = config.maximum,
        "adaptive scaling started"
    );

    loop {
        tick.tick().await;
        let adaptive = config.clone();
        let desired = match ask(&scheduler, |reply| ClientRequest::DesiredWorkers {
            adaptive,
            reply,
        })
        .await
        {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "adaptive scaling stopped");
                return;
            }
        };

        let current = pool.len();
        debug!(current, desired, "adaptive check");
        if desired > current {
            info!(current, desired, "scaling up");
            pool.grow(desired - current);
        } else if desired < current {
            let info: ClusterInfo =
                match ask(&scheduler, |reply| ClientRequest::Identity { reply }).await {
                    Ok(info) => info,
                    Err(e) => {
                        warn!(error = %e, "adaptive scaling stopped");
                        return;
                    }
                };
            info!(current, desired, "scaling down");
            pool.shrink(current - desired, &info).await;
        }
    }
}
