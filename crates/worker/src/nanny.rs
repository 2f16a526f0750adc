//! Supervision of one worker slot.
//!
//! A [`Nanny`] keeps a worker running in its slot. Whenever the worker
//! exits unexpectedly, or is closed with `restart = true`, a fresh worker
//! with a new address takes its place and registers with the scheduler.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use tessera_core::{FunctionRegistry, NannyConfig, WorkerConfig, WorkerId};
use tessera_protocol::LocalNetwork;

use crate::error::WorkerError;
use crate::worker::{Worker, WorkerExit};

enum Command {
    /// Abort the current worker as if it crashed.
    Kill,
    /// Stop the current worker and do not replace it.
    Stop,
}

/// Handle on a supervised worker slot.
pub struct Nanny {
    slot: usize,
    commands: mpsc::UnboundedSender<Command>,
    current: watch::Receiver<Option<WorkerId>>,
    restarts: Arc<AtomicU32>,
    handle: JoinHandle<()>,
}

impl Nanny {
    /// Start supervising slot `slot`. Must be called inside a tokio runtime.
    pub fn spawn(
        slot: usize,
        worker: WorkerConfig,
        config: NannyConfig,
        registry: Arc<FunctionRegistry>,
        network: Arc<LocalNetwork>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (current_tx, current) = watch::channel(None);
        let restarts = Arc::new(AtomicU32::new(0));
        let supervisor = Supervisor {
            slot,
            worker,
            config,
            registry,
            network,
            commands: rx,
            current: current_tx,
            restarts: Arc::clone(&restarts),
        };
        let handle = tokio::spawn(supervisor.run());
        Self {
            slot,
            commands,
            current,
            restarts,
            handle,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Address of the worker currently running in this slot.
    pub fn worker_id(&self) -> Option<WorkerId> {
        self.current.borrow().clone()
    }

    /// Wait until a worker other than `previous` is running.
    pub async fn wait_for_worker(&mut self, previous: Option<&WorkerId>) -> Option<WorkerId> {
        loop {
            if let Some(id) = self.current.borrow_and_update().clone() {
                if Some(&id) != previous {
                    return Some(id);
                }
            }
            if self.current.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Replacements started so far, for any reason.
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Abort the worker without warning, like a process crash.
    pub fn kill(&self) {
        let _ = self.commands.send(Command::Kill);
    }

    /// Stop the slot for good and wait for the supervisor to exit.
    pub async fn stop(self) {
        let _ = self.commands.send(Command::Stop);
        if let Err(e) = self.handle.await {
            warn!(slot = self.slot, error = %e, "nanny task ended abnormally");
        }
    }
}

/// How one worker generation ended.
enum Ended {
    Exited(Result<WorkerExit, WorkerError>),
    Aborted(JoinError),
    Stopped,
}

struct Supervisor {
    slot: usize,
    worker: WorkerConfig,
    config: NannyConfig,
    registry: Arc<FunctionRegistry>,
    network: Arc<LocalNetwork>,
    commands: mpsc::UnboundedReceiver<Command>,
    current: watch::Sender<Option<WorkerId>>,
    restarts: Arc<AtomicU32>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut crashes: VecDeque<Instant> = VecDeque::new();
        loop {
            let id = WorkerId::generate();
            let ended = match Worker::new(
                id.clone(),
                self.worker.clone(),
                Arc::clone(&self.registry),
                Arc::clone(&self.network),
            ) {
                Ok(worker) => self.supervise(&id, worker).await,
                Err(e) => Ended::Exited(Err(e)),
            };
            self.current.send_replace(None);
            self.network.unbind_worker(&id);

            let reason = match ended {
                Ended::Stopped | Ended::Exited(Ok(WorkerExit::Closed)) => {
                    info!(slot = self.slot, worker = %id, "nanny stopping");
                    return;
                }
                Ended::Exited(Ok(WorkerExit::Restart)) => {
                    info!(slot = self.slot, worker = %id, "restarting worker on request");
                    self.restarts.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Ended::Exited(Err(e)) => e.to_string(),
                Ended::Aborted(e) if e.is_cancelled() => "killed".to_string(),
                Ended::Aborted(e) => format!("panicked: {e}"),
            };

            let now = Instant::now();
            let window = self.config.restart_window();
            while crashes.front().is_some_and(|t| now.duration_since(*t) > window) {
                crashes.pop_front();
            }
            crashes.push_back(now);
            if crashes.len() > self.config.max_restarts as usize {
                error!(
                    slot = self.slot,
                    crashes = crashes.len(),
                    window_ms = self.config.restart_window_ms,
                    "worker keeps crashing, giving up on this slot"
                );
                return;
            }

            warn!(slot = self.slot, worker = %id, reason = %reason, "worker died, restarting");
            self.restarts.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn supervise(&mut self, id: &WorkerId, worker: Worker) -> Ended {
        self.current.send_replace(Some(id.clone()));
        let mut task = tokio::spawn(worker.run());
        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(result) => Ended::Exited(result),
                        Err(e) => Ended::Aborted(e),
                    };
                }
                command = self.commands.recv() => match command {
                    Some(Command::Kill) => {
                        warn!(slot = self.slot, worker = %id, "killing worker");
                        task.abort();
                    }
                    Some(Command::Stop) | None => {
                        task.abort();
                        let _ = (&mut task).await;
                        return Ended::Stopped;
                    }
                },
            }
        }
    }
}
