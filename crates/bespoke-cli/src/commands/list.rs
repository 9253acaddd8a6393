//! List command - show submissions known to the coordinator.

use clap::Args;
use owo_colors::OwoColorize;

use crate::client::ApiClient;
use crate::exit::CliResult;
use crate::{Config, OutputFormat};

/// Arguments for the list command.
#[derive(Debug, Args)]
pub struct ListArgs {
    /// Only show submissions with this status.
    #[arg(long)]
    pub status: Option<String>,
}

/// Execute the list command.
///
/// # Errors
///
/// Unreachable errors for connection failures, user errors for an
/// invalid status filter.
pub async fn execute(args: ListArgs, config: &Config) -> CliResult {
    let client = ApiClient::new(config)?;
    let page = client.list(args.status.as_deref()).await?;

    match config.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&page).unwrap_or_default());
        }
        OutputFormat::Text => {
            if page.items.is_empty() {
                println!("No submissions found");
                return Ok(());
            }
            println!("Submissions:");
            for item in &page.items {
                println!(
                    "  {} {} (created {})",
                    item.id,
                    format_status_colored(item.status.as_label()),
                    item.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct Row {
                #[tabled(rename = "ID")]
                id: u64,
                #[tabled(rename = "Status")]
                status: String,
                #[tabled(rename = "Created")]
                created: String,
            }

            let rows: Vec<Row> = page
                .items
                .iter()
                .map(|item| Row {
                    id: item.id.as_u64(),
                    status: item.status.as_label().to_string(),
                    created: item.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                })
                .collect();

            if rows.is_empty() {
                println!("No submissions found");
            } else {
                println!("{}", Table::new(rows));
            }
        }
    }

    Ok(())
}

pub(crate) fn format_status_colored(status: &str) -> String {
    match status {
        "success" => status.green().to_string(),
        "errored" => status.red().to_string(),
        "running" => status.blue().to_string(),
        "waiting" => status.yellow().to_string(),
        "cancelled" | "skipped" => status.dimmed().to_string(),
        _ => status.to_string(),
    }
}
