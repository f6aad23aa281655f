//! Runtime configuration.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

use cassandra_core::sidecar::SIDECAR_PORT;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The operator's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for HTTP healthchecks & metrics.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,

    /// The Kubernetes namespace to watch; all namespaces when empty.
    #[serde(default)]
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    #[serde(default = "Config::default_pod_name")]
    pub pod_name: String,

    /// The port on which node agents serve their HTTP API.
    #[serde(default = "Config::default_sidecar_port")]
    pub sidecar_port: u16,
    /// The fallback requeue interval applied whenever a reconcile ends without a mutation
    /// because the datacenter is not ready for one.
    #[serde(default = "Config::default_requeue_seconds")]
    pub requeue_seconds: u64,
    /// The interval at which backup monitors poll their node agent.
    #[serde(default = "Config::default_backup_poll_millis")]
    pub backup_poll_millis: u64,
    /// The number of consecutive failed polls a backup monitor tolerates before giving up.
    ///
    /// With the default of `0` a monitor stops on its first failed poll, leaving that node's
    /// backup status non-terminal.
    #[serde(default)]
    pub backup_poll_error_tolerance: u32,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate this config.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.requeue_seconds > 0, "REQUEUE_SECONDS must be greater than 0");
        ensure!(self.backup_poll_millis > 0, "BACKUP_POLL_MILLIS must be greater than 0");
        ensure!(self.sidecar_port > 0, "SIDECAR_PORT must be greater than 0");
        Ok(())
    }

    /// The fallback requeue interval of datacenter reconciles.
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_seconds)
    }

    /// The polling interval of backup monitors.
    pub fn backup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.backup_poll_millis)
    }

    fn default_http_port() -> u16 {
        8080
    }

    fn default_pod_name() -> String {
        "cassandra-operator".into()
    }

    fn default_sidecar_port() -> u16 {
        SIDECAR_PORT
    }

    fn default_requeue_seconds() -> u64 {
        60
    }

    fn default_backup_poll_millis() -> u64 {
        1000
    }

    /// Build a config instance for use in tests.
    #[cfg(test)]
    pub fn new_test() -> Self {
        Self {
            rust_log: "error".into(),
            http_port: 8080,
            namespace: "default".into(),
            pod_name: "cassandra-operator-0".into(),
            sidecar_port: SIDECAR_PORT,
            requeue_seconds: 60,
            backup_poll_millis: 1,
            backup_poll_error_tolerance: 0,
        }
    }
}
