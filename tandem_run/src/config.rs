//! Bridge configuration.
//!
//! Values come from [`BridgeConfig::default`] or, for the process-wide
//! bridge, from the environment:
//!
//! | variable                  | field          |
//! |---------------------------|----------------|
//! | `TANDEM_RUN_SCOPE_NAME`   | `scope_name`   |
//! | `TANDEM_RUN_METRICS_ADDR` | `metrics_addr` |

use std::env;
use std::net::SocketAddr;
use std::sync::OnceLock;

use tracing::info;

use crate::error::{Error, Result};

/// Environment variable naming the bridge scope.
pub const SCOPE_NAME_ENV: &str = "TANDEM_RUN_SCOPE_NAME";
/// Environment variable holding the Prometheus listen address.
pub const METRICS_ADDR_ENV: &str = "TANDEM_RUN_METRICS_ADDR";

const DEFAULT_SCOPE_NAME: &str = "tandem-bridge";

/// Settings for a [`crate::BridgeManager`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Name of the scope each bridge run opens, used in logs.
    pub scope_name: String,
    /// Where to serve Prometheus metrics. `None` leaves metrics to whatever
    /// recorder the application installs.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            scope_name: DEFAULT_SCOPE_NAME.to_string(),
            metrics_addr: None,
        }
    }
}

impl BridgeConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name
    /// to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(name) = lookup(SCOPE_NAME_ENV).filter(|name| !name.trim().is_empty()) {
            config.scope_name = name;
        }
        if let Some(addr) = lookup(METRICS_ADDR_ENV) {
            let parsed = addr
                .trim()
                .parse::<SocketAddr>()
                .map_err(|err| Error::Config(format!("{METRICS_ADDR_ENV}={addr:?}: {err}")))?;
            config.metrics_addr = Some(parsed);
        }
        Ok(config)
    }

    /// Sets the Prometheus listen address.
    #[must_use]
    pub fn with_metrics_addr(mut self, addr: SocketAddr) -> Self {
        self.metrics_addr = Some(addr);
        self
    }

    /// Sets the scope name.
    #[must_use]
    pub fn with_scope_name(mut self, name: impl Into<String>) -> Self {
        self.scope_name = name.into();
        self
    }

    /// Starts the Prometheus exporter if `metrics_addr` is set.
    ///
    /// The exporter is process-wide; calls after the first successful
    /// install do nothing.
    pub fn install_metrics(&self) -> Result<()> {
        static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

        let Some(addr) = self.metrics_addr else {
            return Ok(());
        };
        if INSTALLED.get().is_some() {
            return Ok(());
        }
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|err| Error::Config(format!("metrics exporter: {err}")))?;
        let _ = INSTALLED.set(addr);
        info!(%addr, "metrics exporter listening");
        Ok(())
    }
}
