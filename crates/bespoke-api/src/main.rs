//! `bespoke-coordinator` binary entrypoint.
//!
//! Loads configuration from `BESPOKE_*` environment variables, starts the
//! supervisor (result store, queue, coordinator, worker pools), and serves
//! the HTTP API until interrupted. Scientific executors default to the
//! built-in deterministic stubs; a deployment with a chemistry stack
//! swaps its own [`ExecutorSet`] in through the library API.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use anyhow::Result;
use tokio::sync::watch;

use bespoke_api::config::ApiConfig;
use bespoke_api::server::Server;
use bespoke_core::observability::{init_logging, LogFormat};
use bespoke_flow::config::ExecutorConfig;
use bespoke_flow::executor::ExecutorSet;
use bespoke_flow::supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    let api_config = ApiConfig::from_env()?;
    let executor_config = ExecutorConfig::from_env()?;

    init_logging(if api_config.debug {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    });

    let supervisor = Supervisor::new(executor_config, ExecutorSet::stubs());
    let coordinator = supervisor.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = Server::new(api_config, coordinator);

    tokio::select! {
        served = server.serve(shutdown_rx) => served?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("interrupt received; draining");
        }
    }

    let _ = shutdown_tx.send(true);
    supervisor.shutdown().await;
    Ok(())
}
