//! Launch command - run the coordinator service and worker pools.

use std::path::PathBuf;

use clap::Args;
use tokio::sync::watch;

use bespoke_api::config::ApiConfig;
use bespoke_api::server::Server;
use bespoke_flow::config::{CoreBudget, ExecutorConfig};
use bespoke_flow::executor::ExecutorSet;
use bespoke_flow::supervisor::Supervisor;

use crate::exit::{CliError, CliResult};

/// Arguments for the launch command.
#[derive(Debug, Args)]
pub struct LaunchArgs {
    /// Directory holding the result store.
    #[arg(long)]
    pub directory: Option<PathBuf>,

    /// Number of fragmentation workers.
    #[arg(long)]
    pub n_fragmenter_workers: Option<usize>,

    /// Number of optimizer workers.
    #[arg(long)]
    pub n_optimizer_workers: Option<usize>,

    /// Number of QC compute workers.
    #[arg(long)]
    pub n_qc_compute_workers: Option<usize>,

    /// Cores per QC worker ('auto' = all CPUs).
    #[arg(long)]
    pub qc_compute_n_cores: Option<String>,

    /// Memory guideline in GiB per core for QC workers.
    #[arg(long)]
    pub qc_compute_max_mem: Option<f64>,

    /// Bind address for the HTTP API.
    #[arg(long)]
    pub bind: Option<String>,
}

/// Execute the launch command.
///
/// # Errors
///
/// Returns a user error for invalid flags and an internal error when the
/// deployment fails to start.
pub async fn execute(args: LaunchArgs) -> CliResult {
    let mut config = ExecutorConfig::from_env()
        .map_err(|e| CliError::User(format!("invalid environment configuration: {e}")))?;

    if let Some(directory) = args.directory {
        config.directory = directory;
    }
    if let Some(n) = args.n_fragmenter_workers {
        config.n_fragmenter_workers = n;
    }
    if let Some(n) = args.n_optimizer_workers {
        config.n_optimizer_workers = n;
    }
    if let Some(n) = args.n_qc_compute_workers {
        config.n_qc_compute_workers = n;
    }
    if let Some(raw) = args.qc_compute_n_cores {
        config.qc_compute_n_cores = raw
            .parse::<CoreBudget>()
            .map_err(|e| CliError::User(e.to_string()))?;
    }
    if let Some(mem) = args.qc_compute_max_mem {
        config.qc_compute_max_mem = Some(mem);
    }
    if let Some(raw) = args.bind {
        config.bind = raw
            .parse()
            .map_err(|e| CliError::User(format!("invalid bind address: {e}")))?;
    }

    let api_config = ApiConfig {
        bind: config.bind,
        debug: true,
        ..ApiConfig::default()
    };

    let supervisor = Supervisor::new(config, ExecutorSet::stubs());
    let coordinator = supervisor
        .start()
        .await
        .map_err(|e| CliError::Other(anyhow::anyhow!("failed to start executor: {e}")))?;

    println!("coordinator listening on http://{}", api_config.bind);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = Server::new(api_config, coordinator);

    let outcome = tokio::select! {
        served = server.serve(shutdown_rx) => {
            served.map_err(|e| CliError::Other(anyhow::anyhow!("server failed: {e}")))
        }
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| CliError::Other(anyhow::anyhow!("signal handling failed: {e}")))?;
            println!("interrupt received; draining workers");
            Ok(())
        }
    };

    let _ = shutdown_tx.send(true);
    supervisor.shutdown().await;
    outcome
}
