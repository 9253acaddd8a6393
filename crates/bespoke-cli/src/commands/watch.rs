//! Watch command - follow a submission until it settles.

use std::collections::HashMap;
use std::time::Duration;

use clap::Args;

use bespoke_flow::submission::SubmissionStatus;

use crate::client::ApiClient;
use crate::commands::list::format_status_colored;
use crate::exit::{CliError, CliResult};
use crate::Config;

/// Arguments for the watch command.
#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Submission id to follow.
    #[arg(long)]
    pub id: u64,

    /// Poll interval in seconds.
    #[arg(long, default_value_t = 2)]
    pub interval: u64,
}

/// Execute the watch command.
///
/// Prints stage transitions as they happen and exits with the code
/// matching the submission's terminal status.
///
/// # Errors
///
/// `SubmissionErrored` / `SubmissionCancelled` for those outcomes,
/// unreachable errors for connection failures.
pub async fn execute(args: WatchArgs, config: &Config) -> CliResult {
    let client = ApiClient::new(config)?;
    let mut last_seen: HashMap<String, String> = HashMap::new();

    loop {
        let detail = client.get_detail(args.id).await?;

        for stage in &detail.stages {
            let name = stage.name.to_string();
            let status = stage.status.to_string();
            if last_seen.get(&name) != Some(&status) {
                let done = stage
                    .tasks
                    .iter()
                    .filter(|t| t.status.is_terminal())
                    .count();
                println!(
                    "[{}] {name}: {} ({done}/{} tasks settled)",
                    args.id,
                    format_status_colored(&status),
                    stage.tasks.len()
                );
                last_seen.insert(name, status);
            }
        }

        match detail.status {
            SubmissionStatus::Success => {
                println!("[{}] {}", args.id, format_status_colored("success"));
                return Ok(());
            }
            SubmissionStatus::Errored => {
                println!("[{}] {}", args.id, format_status_colored("errored"));
                if let Some(stage) = detail.stages.iter().find(|s| s.error.is_some()) {
                    if let Some(error) = &stage.error {
                        eprintln!("  {}: {error}", stage.name);
                    }
                }
                return Err(CliError::SubmissionErrored);
            }
            SubmissionStatus::Cancelled => {
                println!("[{}] {}", args.id, format_status_colored("cancelled"));
                return Err(CliError::SubmissionCancelled);
            }
            SubmissionStatus::Waiting | SubmissionStatus::Running => {}
        }

        tokio::time::sleep(Duration::from_secs(args.interval.max(1))).await;
    }
}
