//! HTTP server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use bespoke_flow::config::DEFAULT_BIND;

/// Configuration of the coordinator's HTTP surface.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Address the server binds to.
    pub bind: SocketAddr,
    /// Per-request wall-clock budget.
    pub request_timeout: Duration,
    /// Pretty-print logs instead of JSON (development).
    pub debug: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.parse().expect("default bind address parses"),
            request_timeout: Duration::from_secs(30),
            debug: false,
        }
    }
}

impl ApiConfig {
    /// Loads configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error when `BESPOKE_BIND` is present but unparseable.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("BESPOKE_BIND") {
            if !raw.trim().is_empty() {
                config.bind = raw
                    .parse()
                    .map_err(|e| anyhow::anyhow!("BESPOKE_BIND invalid: {e}"))?;
            }
        }
        if let Ok(raw) = std::env::var("BESPOKE_REQUEST_TIMEOUT_SECS") {
            if !raw.trim().is_empty() {
                let secs: u64 = raw
                    .parse()
                    .map_err(|e| anyhow::anyhow!("BESPOKE_REQUEST_TIMEOUT_SECS invalid: {e}"))?;
                config.request_timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(raw) = std::env::var("BESPOKE_DEBUG") {
            config.debug = matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bind_matches_documented_value() {
        let config = ApiConfig::default();
        assert_eq!(config.bind.to_string(), "127.0.0.1:15323");
        assert!(!config.debug);
    }
}
