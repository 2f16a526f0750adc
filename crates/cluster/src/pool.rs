use std::cmp::Reverse;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::info;

use tessera_core::{FunctionRegistry, NannyConfig, WorkerConfig, WorkerId};
use tessera_protocol::{ClusterInfo, LocalNetwork};
use tessera_worker::Nanny;

#[derive(Default)]
struct Slots {
    nannies: Vec<Nanny>,
    next: usize,
}

/// The set of nanny-supervised worker slots in a local cluster.
pub(crate) struct WorkerPool {
    worker: WorkerConfig,
    nanny: NannyConfig,
    registry: Arc<FunctionRegistry>,
    network: Arc<LocalNetwork>,
    slots: Mutex<Slots>,
}

impl WorkerPool {
    pub(crate) fn new(
        worker: WorkerConfig,
        nanny: NannyConfig,
        registry: Arc<FunctionRegistry>,
        network: Arc<LocalNetwork>,
    ) -> Self {
        Self {
            worker,
            nanny,
            registry,
            network,
            slots: Mutex::new(Slots::default()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // Slots whose nanny gave up no longer count.
        slots.nannies.retain(Nanny::is_running);
        slots
    }

    pub(crate) fn len(&self) -> usize {
        self.slots().nannies.len()
    }

    /// Start `n` more supervised workers.
    pub(crate) fn grow(&self, n: usize) {
        let mut slots = self.slots();
        for _ in 0..n {
            let slot = slots.next;
            slots.next += 1;
            slots.nannies.push(Nanny::spawn(
                slot,
                self.worker.clone(),
                self.nanny.clone(),
                Arc::clone(&self.registry),
                Arc::clone(&self.network),
            ));
        }
        info!(added = n, total = slots.nannies.len(), "workers added");
    }

    /// Stop `n` workers, least busy first according to `info`.
    pub(crate) async fn shrink(&self, n: usize, info: &ClusterInfo) {
        let retired = {
            let mut slots = self.slots();
            let load = |nanny: &Nanny| {
                nanny
                    .worker_id()
                    .and_then(|id| info.workers.iter().find(|w| w.id == id))
                    .map_or((0, 0), |w| (w.processing, w.keys))
            };
            slots.nannies.sort_by_key(|nanny| Reverse(load(nanny)));
            let keep = slots.nannies.len().saturating_sub(n);
            slots.nannies.split_off(keep)
        };
        for nanny in retired {
            info!(slot = nanny.slot(), worker = ?nanny.worker_id(), "retiring worker");
            nanny.stop().await;
        }
    }

    pub(crate) fn worker_ids(&self) -> Vec<WorkerId> {
        self.slots()
            .nannies
            .iter()
            .filter_map(Nanny::worker_id)
            .collect()
    }

    /// Abort the worker with this address. Its nanny starts a replacement.
    pub(crate) fn kill(&self, worker: &WorkerId) -> bool {
        let slots = self.slots();
        match slots
            .nannies
            .iter()
            .find(|n| n.worker_id().as_ref() == Some(worker))
        {
            Some(nanny) => {
                nanny.kill();
                true
            }
            None => false,
        }
    }

    /// Replacements started across all slots.
    pub(crate) fn restarts(&self) -> u32 {
        self.slots().nannies.iter().map(Nanny::restarts).sum()
    }

    pub(crate) async fn stop_all(&self) {
        let nannies = std::mem::take(&mut self.slots().nannies);
        for nanny in nannies {
            nanny.stop().await;
        }
    }
}
