use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tessera_client::Client;
use tessera_core::{ClusterConfig, FunctionRegistry, WorkerId};
use tessera_protocol::{ClientRequest, ClusterInfo, LocalNetwork, SchedulerInbox};
use tessera_scheduler::{Scheduler, SchedulerMetrics};

use crate::adaptive::{self, ask};
use crate::error::ClusterError;
use crate::pool::WorkerPool;

/// How long `start` and `scale` wait for workers to register.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// A scheduler and its workers, all inside the current process.
pub struct LocalCluster {
    config: ClusterConfig,
    network: Arc<LocalNetwork>,
    scheduler_inbox: SchedulerInbox,
    scheduler: JoinHandle<()>,
    metrics: Arc<RwLock<SchedulerMetrics>>,
    pool: Arc<WorkerPool>,
    adaptive: Option<JoinHandle<()>>,
    client: Client,
}

impl LocalCluster {
    /// Start a scheduler and `config.cluster.n_workers` workers, and wait
    /// until every worker has registered.
    pub async fn start(
        config: ClusterConfig,
        registry: FunctionRegistry,
    ) -> Result<Self, ClusterError> {
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let network = Arc::new(LocalNetwork::new(tx));
        let scheduler = Scheduler::new(config.scheduler.clone(), Arc::clone(&network), rx);
        let metrics = scheduler.metrics_handle();
        let scheduler = scheduler.spawn();

        let pool = Arc::new(WorkerPool::new(
            config.worker.clone(),
            config.nanny.clone(),
            Arc::new(registry),
            Arc::clone(&network),
        ));
        pool.grow(config.cluster.n_workers);

        let client = Client::new(Arc::clone(&network));
        if let Err(e) = client
            .wait_for_workers(config.cluster.n_workers, STARTUP_TIMEOUT)
            .await
        {
            pool.stop_all().await;
            scheduler.abort();
            return Err(e.into());
        }

        let scheduler_inbox = network.scheduler();
        let adaptive = config.adaptive.enabled.then(|| {
            tokio::spawn(adaptive::run(
                config.adaptive.clone(),
                Arc::clone(&pool),
                scheduler_inbox.clone(),
            ))
        });

        info!(
            workers = config.cluster.n_workers,
            adaptive = config.adaptive.enabled,
            "local cluster started"
        );
        Ok(Self {
            config,
            network,
            scheduler_inbox,
            scheduler,
            metrics,
            pool,
            adaptive,
            client,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// A new client connected to this cluster.
    pub fn client(&self) -> Client {
        Client::new(Arc::clone(&self.network))
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    /// Addresses of the workers running right now.
    pub fn workers(&self) -> Vec<WorkerId> {
        self.pool.worker_ids()
    }

    /// Worker restarts across all slots since the cluster started.
    pub fn restarts(&self) -> u32 {
        self.pool.restarts()
    }

    /// Abort a worker as if its process crashed. Its nanny replaces it.
    pub fn kill_worker(&self, worker: &WorkerId) -> bool {
        let killed = self.pool.kill(worker);
        if killed {
            warn!(worker = %worker, "worker killed");
        }
        killed
    }

    /// Grow or shrink to `n` workers. Growing waits for the new workers to
    /// register.
    pub async fn scale(&self, n: usize) -> Result<(), ClusterError> {
        let current = self.pool.len();
        if n > current {
            self.pool.grow(n - current);
            self.client.wait_for_workers(n, STARTUP_TIMEOUT).await?;
        } else if n < current {
            let info = self.status().await?;
            self.pool.shrink(current - n, &info).await;
        }
        info!(from = current, to = n, "cluster scaled");
        Ok(())
    }

    pub async fn status(&self) -> Result<ClusterInfo, ClusterError> {
        ask(&self.scheduler_inbox, |reply| ClientRequest::Identity { reply }).await
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Close every worker and stop the scheduler.
    pub async fn shutdown(self) {
        if let Some(adaptive) = self.adaptive {
            adaptive.abort();
        }
        if ask(&self.scheduler_inbox, |reply| ClientRequest::Shutdown { reply })
            .await
            .is_err()
        {
            warn!("scheduler was already gone at shutdown");
        }
        self.pool.stop_all().await;
        if let Err(e) = self.scheduler.await {
            warn!(error = %e, "scheduler task ended abnormally");
        }
        info!("local cluster stopped");
    }
}
