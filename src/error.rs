use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployResourceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot reach {target}: {message}")]
    Connectivity { target: String, message: String },

    #[error("bosh {step} blocked by another operation on the director: {message}")]
    Contention { step: String, message: String },

    #[error("bosh {step} failed (exit {status:?}): {output}")]
    ToolExecution {
        step: String,
        status: Option<i32>,
        output: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error(
        "bosh CLI not found (searched {searched}). Install it or point --bosh-cli / BOSH_RESOURCE_CLI at the binary."
    )]
    CliMissing { searched: String },

    #[error("unexpected output from bosh {step}: {message}")]
    UnexpectedOutput { step: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),

    #[error("telemetry initialization error: {0}")]
    Telemetry(String),

    #[error("unexpected error: {0}")]
    Other(String),
}

impl DeployResourceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DeployResourceError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, DeployResourceError>;
