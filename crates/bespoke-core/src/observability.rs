//! Observability infrastructure for executor services.
//!
//! Structured logging with consistent spans. The coordinator, workers, and
//! CLI all initialize through [`init_logging`] so `RUST_LOG` behaves the
//! same everywhere.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for long-lived deployments).
    Json,
    /// Pretty-printed logs (for development and the CLI).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at process startup. Safe to call multiple times; subsequent
/// calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: controls log levels (e.g. `info`, `bespoke_flow=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for submission-scoped operations.
#[must_use]
pub fn submission_span(operation: &str, submission_id: u64) -> Span {
    tracing::info_span!("submission", op = operation, submission_id)
}

/// Creates a span for a worker executing a task.
#[must_use]
pub fn worker_span(routing_key: &str, task_id: &str, attempt: u32) -> Span {
    tracing::info_span!("worker", routing_key, task_id, attempt)
}
