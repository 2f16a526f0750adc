use std::path::PathBuf;

use clap::Parser;

/// Run a local tessera cluster: one scheduler plus supervised workers.
#[derive(Parser, Debug)]
#[command(name = "tessera-cluster", about = "Run a local tessera cluster")]
pub struct CliArgs {
    /// Path to a TOML config file (defaults are used when omitted)
    #[arg(long, env = "TESSERA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of workers, overriding `cluster.n_workers`
    #[arg(long, env = "TESSERA_WORKERS")]
    pub workers: Option<usize>,

    /// Seconds between status log lines
    #[arg(long, default_value = "10")]
    pub status_interval: u64,

    /// Submit this many demo tasks after startup and log their sum
    #[arg(long)]
    pub demo: Option<u64>,
}
