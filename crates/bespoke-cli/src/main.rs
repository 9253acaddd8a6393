//! `bespoke` CLI binary entrypoint.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bespoke_cli::exit::CliResult;
use bespoke_cli::{Cli, Commands};

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to create runtime: {error}");
            std::process::exit(1);
        }
    };

    let outcome: CliResult = runtime.block_on(async {
        match cli.command {
            Commands::Launch(args) => bespoke_cli::commands::launch::execute(args).await,
            Commands::Submit(args) => bespoke_cli::commands::submit::execute(args, &config).await,
            Commands::List(args) => bespoke_cli::commands::list::execute(args, &config).await,
            Commands::Watch(args) => bespoke_cli::commands::watch::execute(args, &config).await,
            Commands::Retrieve(args) => {
                bespoke_cli::commands::retrieve::execute(args, &config).await
            }
            Commands::Cancel(args) => bespoke_cli::commands::cancel::execute(args, &config).await,
        }
    });

    if let Err(error) = outcome {
        eprintln!("{error}");
        std::process::exit(error.code());
    }
}
