//! # bespoke-cli
//!
//! Command-line interface for the bespoke executor coordinator.
//!
//! ## Commands
//!
//! - `bespoke launch` - Run the coordinator and worker pools
//! - `bespoke submit` - Submit a molecule for bespoke parameterization
//! - `bespoke list` - List submissions
//! - `bespoke watch` - Follow a submission until it settles
//! - `bespoke retrieve` - Download results and the refit force field
//! - `bespoke cancel` - Cancel a submission
//!
//! ## Exit codes
//!
//! `0` success, `2` user error (invalid flags or schema), `3` coordinator
//! unreachable, `4` submission errored, `5` submission cancelled.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

pub mod client;
pub mod commands;
pub mod exit;

use clap::{Parser, Subcommand};

/// Bespoke executor command-line interface.
#[derive(Debug, Parser)]
#[command(name = "bespoke")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Coordinator API URL.
    #[arg(long, env = "BESPOKE_API_URL", default_value = "http://127.0.0.1:15323")]
    pub api_url: String,

    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Get the effective configuration.
    #[must_use]
    pub fn config(&self) -> Config {
        Config {
            api_url: self.api_url.clone(),
            format: self.format,
        }
    }
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Launch the coordinator service and worker pools.
    Launch(commands::launch::LaunchArgs),
    /// Submit a molecule for bespoke parameterization.
    Submit(commands::submit::SubmitArgs),
    /// List submissions.
    List(commands::list::ListArgs),
    /// Follow a submission until it settles.
    Watch(commands::watch::WatchArgs),
    /// Download a submission's results.
    Retrieve(commands::retrieve::RetrieveArgs),
    /// Cancel a submission.
    Cancel(commands::cancel::CancelArgs),
}

/// Output format.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output.
    Json,
    /// Table output.
    Table,
}

/// CLI configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Coordinator API URL.
    pub api_url: String,
    /// Output format.
    pub format: OutputFormat,
}
