//! Retrieve command - download a submission's results.

use std::path::PathBuf;

use clap::Args;

use bespoke_flow::submission::SubmissionStatus;

use crate::client::ApiClient;
use crate::exit::{CliError, CliResult};
use crate::Config;

/// Arguments for the retrieve command.
#[derive(Debug, Args)]
pub struct RetrieveArgs {
    /// Submission id to retrieve.
    #[arg(long)]
    pub id: u64,

    /// Path the full state document is written to.
    #[arg(long)]
    pub output: PathBuf,

    /// Path the refit force field is written to, when available.
    #[arg(long)]
    pub force_field: Option<PathBuf>,
}

/// Execute the retrieve command.
///
/// The full state document is always written; the refit force field only
/// exists for successful submissions. The exit code reflects the
/// submission's terminal status.
///
/// # Errors
///
/// User errors for unwritable paths, `SubmissionErrored` /
/// `SubmissionCancelled` for those outcomes.
pub async fn execute(args: RetrieveArgs, config: &Config) -> CliResult {
    let client = ApiClient::new(config)?;
    let detail = client.get_detail(args.id).await?;

    let document = serde_json::to_string_pretty(&detail)
        .map_err(|e| CliError::Other(anyhow::anyhow!("failed to serialize state: {e}")))?;
    std::fs::write(&args.output, document).map_err(|e| {
        CliError::User(format!("failed to write {}: {e}", args.output.display()))
    })?;
    println!("wrote state document to {}", args.output.display());

    if let Some(path) = &args.force_field {
        match &detail.result {
            Some(result) => {
                std::fs::write(path, &result.refit_force_field).map_err(|e| {
                    CliError::User(format!("failed to write {}: {e}", path.display()))
                })?;
                println!("wrote refit force field to {}", path.display());
            }
            None => {
                eprintln!(
                    "no refit force field available (status: {})",
                    detail.status
                );
            }
        }
    }

    match detail.status {
        SubmissionStatus::Errored => Err(CliError::SubmissionErrored),
        SubmissionStatus::Cancelled => Err(CliError::SubmissionCancelled),
        _ => Ok(()),
    }
}
