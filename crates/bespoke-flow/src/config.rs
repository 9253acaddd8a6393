//! Executor configuration.
//!
//! An explicit configuration value constructed once and passed to the
//! supervisor; nothing reads environment variables after startup. Every
//! option has a default keyed to single-host operation, and every
//! `BESPOKE_*` variable overrides exactly one field.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::task::RoutingKey;

/// Default HTTP bind address.
pub const DEFAULT_BIND: &str = "127.0.0.1:15323";

/// Default result store directory.
pub const DEFAULT_DIRECTORY: &str = "./bespoke-state";

/// Core budget for a worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreBudget {
    /// Use every CPU the host reports.
    Auto,
    /// Use a fixed core count.
    Fixed(usize),
}

impl CoreBudget {
    /// Resolves the budget against the host's CPU count.
    #[must_use]
    pub fn resolve(&self) -> usize {
        match self {
            Self::Auto => std::thread::available_parallelism().map_or(1, std::num::NonZero::get),
            Self::Fixed(n) => (*n).max(1),
        }
    }
}

impl std::str::FromStr for CoreBudget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        s.parse::<usize>().map(Self::Fixed).map_err(|_| {
            Error::internal(format!("core budget must be 'auto' or a number, got {s:?}"))
        })
    }
}

/// Full configuration of one executor deployment.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of fragmentation workers.
    pub n_fragmenter_workers: usize,
    /// Number of QC compute workers.
    pub n_qc_compute_workers: usize,
    /// Number of optimizer workers.
    pub n_optimizer_workers: usize,
    /// Core budget per QC worker (`auto` = all CPUs). Fragmenter and
    /// optimizer workers use one core each.
    pub qc_compute_n_cores: CoreBudget,
    /// Memory guideline in GiB per core for QC workers; best-effort.
    pub qc_compute_max_mem: Option<f64>,
    /// Bind address of the HTTP API.
    pub bind: SocketAddr,
    /// Result store directory.
    pub directory: PathBuf,
    /// Task queue backend URL.
    pub queue_url: String,
    /// Cache lease time-to-live. Heartbeats run at a third of this.
    pub lease_ttl: Duration,
    /// Transient-failure redelivery budget per routing key.
    pub retry_limits: HashMap<RoutingKey, u32>,
    /// How long shutdown waits for workers to drain before aborting.
    pub shutdown_grace: Duration,
    /// Keep intermediate working files instead of cleaning up.
    pub keep_files: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            n_fragmenter_workers: 1,
            n_qc_compute_workers: 1,
            n_optimizer_workers: 1,
            qc_compute_n_cores: CoreBudget::Auto,
            qc_compute_max_mem: None,
            bind: DEFAULT_BIND.parse().expect("default bind address parses"),
            directory: PathBuf::from(DEFAULT_DIRECTORY),
            queue_url: "embedded".to_string(),
            lease_ttl: Duration::from_secs(300),
            retry_limits: default_retry_limits(),
            shutdown_grace: Duration::from_secs(30),
            keep_files: false,
        }
    }
}

/// The default redelivery budget: QC tasks survive two redeliveries,
/// fragmentation and optimization none.
#[must_use]
pub fn default_retry_limits() -> HashMap<RoutingKey, u32> {
    [
        (RoutingKey::Fragment, 0),
        (RoutingKey::Qc, 2),
        (RoutingKey::Optimize, 0),
    ]
    .into_iter()
    .collect()
}

impl ExecutorConfig {
    /// Loads configuration from `BESPOKE_*` environment variables,
    /// falling back to the defaults above.
    ///
    /// # Errors
    ///
    /// Returns an error when a variable is present but unparseable.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(n) = env_usize("BESPOKE_N_FRAGMENTER_WORKERS")? {
            config.n_fragmenter_workers = n;
        }
        if let Some(n) = env_usize("BESPOKE_N_QC_COMPUTE_WORKERS")? {
            config.n_qc_compute_workers = n;
        }
        if let Some(n) = env_usize("BESPOKE_N_OPTIMIZER_WORKERS")? {
            config.n_optimizer_workers = n;
        }
        if let Some(raw) = env_string("BESPOKE_QC_COMPUTE_N_CORES") {
            config.qc_compute_n_cores = raw.parse()?;
        }
        if let Some(mem) = env_f64("BESPOKE_QC_COMPUTE_MAX_MEM")? {
            config.qc_compute_max_mem = Some(mem);
        }
        if let Some(raw) = env_string("BESPOKE_BIND") {
            config.bind = raw
                .parse()
                .map_err(|e| Error::internal(format!("BESPOKE_BIND invalid: {e}")))?;
        }
        if let Some(raw) = env_string("BESPOKE_DIRECTORY") {
            config.directory = PathBuf::from(raw);
        }
        if let Some(raw) = env_string("BESPOKE_QUEUE_URL") {
            config.queue_url = raw;
        }
        if let Some(secs) = env_u64("BESPOKE_LEASE_TTL_SECS")? {
            config.lease_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("BESPOKE_SHUTDOWN_GRACE_SECS")? {
            config.shutdown_grace = Duration::from_secs(secs);
        }
        if let Some(keep) = env_bool("BESPOKE_KEEP_FILES")? {
            config.keep_files = keep;
        }

        Ok(config)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    env_string(name)
        .map(|raw| {
            raw.parse()
                .map_err(|e| Error::internal(format!("{name} invalid: {e}")))
        })
        .transpose()
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    env_string(name)
        .map(|raw| {
            raw.parse()
                .map_err(|e| Error::internal(format!("{name} invalid: {e}")))
        })
        .transpose()
}

fn env_f64(name: &str) -> Result<Option<f64>> {
    env_string(name)
        .map(|raw| {
            raw.parse()
                .map_err(|e| Error::internal(format!("{name} invalid: {e}")))
        })
        .transpose()
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    env_string(name)
        .map(|raw| match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(Error::internal(format!("{name} invalid boolean: {other}"))),
        })
        .transpose()
}
