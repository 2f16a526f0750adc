mod cli;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use tessera_cluster::{builtins, LocalCluster};
use tessera_core::ClusterConfig;

use crate::cli::CliArgs;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    // An empty document still picks up env overrides and validation.
    let mut config = match &args.config {
        Some(path) => ClusterConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ClusterConfig::from_toml("").context("invalid default configuration")?,
    };
    if let Some(workers) = args.workers {
        config.cluster.n_workers = workers;
    }

    let cluster = LocalCluster::start(config, builtins::registry())
        .await
        .context("failed to start cluster")?;

    if let Some(n) = args.demo {
        run_demo(&cluster, n).await.context("demo workload failed")?;
    }

    let mut status = interval(Duration::from_secs(args.status_interval.max(1)));
    status.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = status.tick() => log_status(&cluster).await,
        }
    }

    info!("Shutdown signal received");
    cluster.shutdown().await;
    Ok(())
}

async fn run_demo(cluster: &LocalCluster, n: u64) -> Result<()> {
    let client = cluster.client();
    let futures = client.map("inc", 0..n as i64, true).await?;
    let keys: Vec<_> = futures.iter().map(|f| f.key().clone()).collect();
    let total = client.submit(builtins::sum_of(&keys)).await?;
    let sum: i64 = total.result().await?;
    info!(tasks = n, sum, "demo finished");
    Ok(())
}

async fn log_status(cluster: &LocalCluster) {
    match cluster.status().await {
        Ok(status) => {
            let metrics = cluster.metrics();
            info!(
                workers = status.workers.len(),
                cores = status.total_cores(),
                tasks = status.tasks,
                unrunnable = status.unrunnable,
                memory = status.workers.iter().map(|w| w.memory_used).sum::<u64>(),
                spilled = status.workers.iter().map(|w| w.spilled_bytes).sum::<u64>(),
                finished = metrics.total_finished(),
                erred = metrics.tasks_erred,
                restarts = cluster.restarts(),
                "cluster status"
            );
        }
        Err(e) => warn!(error = %e, "status query failed"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
