use tracing_subscriber::EnvFilter;

use crate::error::{DeployResourceError, Result};

/// Installs the global subscriber. Logs go to stderr; stdout carries the resource response.
pub fn init(level: &str) -> Result<()> {
    let filter = filter_from(level)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| DeployResourceError::Telemetry(err.to_string()))
}

fn filter_from(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level)
        .map_err(|err| DeployResourceError::Telemetry(format!("invalid log filter '{level}': {err}")))
}
