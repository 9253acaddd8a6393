//! Cancel command - cooperatively cancel a submission.

use clap::Args;

use crate::client::ApiClient;
use crate::exit::CliResult;
use crate::Config;

/// Arguments for the cancel command.
#[derive(Debug, Args)]
pub struct CancelArgs {
    /// Submission id to cancel.
    #[arg(long)]
    pub id: u64,
}

/// Execute the cancel command.
///
/// # Errors
///
/// User errors for unknown ids, unreachable errors for connection
/// failures.
pub async fn execute(args: CancelArgs, config: &Config) -> CliResult {
    let client = ApiClient::new(config)?;
    client.cancel(args.id).await?;
    println!("cancellation acknowledged for submission {}", args.id);
    Ok(())
}
