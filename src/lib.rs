#![forbid(unsafe_code)]

pub mod apply;
pub mod check;
pub mod concourse;
pub mod config;
pub mod coordinator;
pub mod deploy;
pub mod director;
pub mod error;
pub mod fetch;
pub mod redact;
pub mod runner;
pub mod telemetry;
pub mod tunnel;
pub mod version;

pub use check::{CheckEngine, CheckState};
pub use concourse::{CheckRequest, InRequest, MetadataField, OutRequest, VersionResponse};
pub use config::{Action, CliArgs, Command, OutParams, RuntimeConfig, SourceConfig};
pub use coordinator::{CliCoordinator, Session};
pub use deploy::DeployPipeline;
pub use director::{BoshDirector, Director};
pub use error::{DeployResourceError, Result};
pub use fetch::FetchPipeline;
pub use redact::Redactor;
pub use runner::{CommandResult, CommandRunner, CommandSpec, ProcessCommandRunner, RetryPolicy};
pub use tunnel::{JumpConnector, SshTunnelProvider, Tunnel, TunnelProvider};
pub use version::Version;
