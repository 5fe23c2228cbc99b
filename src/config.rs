use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use url::{Host, Url};

use crate::error::{DeployResourceError, Result};
use crate::runner::RetryPolicy;

const DEFAULT_JUMPBOX_USER: &str = "jumpbox";
const DEFAULT_SSH_PORT: u16 = 22;

/// Resource step requested by Concourse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Check,
    In { destination: PathBuf },
    Out { sources: PathBuf },
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Check => "check",
            Action::In { .. } => "in",
            Action::Out { .. } => "out",
        }
    }
}

/// Top-level CLI structure.
#[derive(Debug, Parser)]
#[command(
    name = "bosh-deployment-resource",
    version,
    about = "Concourse resource for BOSH deployments.",
    long_about = "Reads a Concourse request on stdin, drives the bosh CLI (optionally through an SSH jump host) and writes the JSON response on stdout. Diagnostics go to stderr."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Explicit path to the bosh CLI (otherwise PATH and standard locations are searched).
    #[arg(long, global = true, env = "BOSH_RESOURCE_CLI")]
    pub bosh_cli: Option<PathBuf>,

    /// Attempts per bosh command when the failure is transient.
    #[arg(long, global = true, env = "BOSH_RESOURCE_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    /// Initial backoff between retries, doubled on every attempt.
    #[arg(long, global = true, env = "BOSH_RESOURCE_RETRY_BACKOFF", default_value_t = 5)]
    pub retry_backoff_secs: u64,

    /// Directory under which per-session credential directories are created.
    #[arg(long, global = true, env = "BOSH_RESOURCE_TMPDIR")]
    pub temp_root: Option<PathBuf>,

    /// Log filter (tracing EnvFilter syntax).
    #[arg(long, global = true, env = "BOSH_RESOURCE_LOG", default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Report the fingerprint of the currently deployed manifest.
    Check,
    /// Fetch the deployed manifest into a destination directory.
    In {
        /// Directory the manifest and target files are written to.
        destination: PathBuf,
    },
    /// Deploy or delete the deployment using the request params.
    Out {
        /// Directory that relative params paths are resolved against.
        sources: PathBuf,
    },
}

/// Process-level configuration, independent of the Concourse request.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub action: Action,
    pub cli_path: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub temp_root: Option<PathBuf>,
    pub log_level: String,
}

impl RuntimeConfig {
    pub fn from_args(cli: CliArgs) -> Result<Self> {
        let action = match cli.command {
            Command::Check => Action::Check,
            Command::In { destination } => Action::In { destination },
            Command::Out { sources } => {
                if !sources.is_dir() {
                    return Err(DeployResourceError::Config(format!(
                        "sources directory {} does not exist",
                        sources.display()
                    )));
                }
                Action::Out { sources }
            }
        };

        if cli.max_attempts == 0 {
            return Err(DeployResourceError::Config(
                "--max-attempts must be at least 1".into(),
            ));
        }

        if let Some(root) = &cli.temp_root
            && !root.is_dir()
        {
            return Err(DeployResourceError::Config(format!(
                "temp root {} is not a directory",
                root.display()
            )));
        }

        Ok(Self {
            action,
            cli_path: cli.bosh_cli,
            retry: RetryPolicy::new(
                cli.max_attempts,
                Duration::from_secs(cli.retry_backoff_secs),
            ),
            temp_root: cli.temp_root,
            log_level: cli.log_level,
        })
    }
}

/// Director credentials. Both schemes are handed to the CLI as BOSH_CLIENT/BOSH_CLIENT_SECRET.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Client { id: String, secret: String },
    User { username: String, password: String },
}

impl Credentials {
    pub fn identity(&self) -> &str {
        match self {
            Credentials::Client { id, .. } => id,
            Credentials::User { username, .. } => username,
        }
    }

    pub fn secret(&self) -> &str {
        match self {
            Credentials::Client { secret, .. } => secret,
            Credentials::User { password, .. } => password,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Client { id, .. } => f
                .debug_struct("Client")
                .field("id", id)
                .field("secret", &"<redacted>")
                .finish(),
            Credentials::User { username, .. } => f
                .debug_struct("User")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// SSH endpoint used to reach a director on a private network.
#[derive(Clone, PartialEq, Eq)]
pub struct JumpHost {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub private_key: String,
}

impl JumpHost {
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Debug for JumpHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JumpHost")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Validated description of the deployment target. Only constructible through validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawSource")]
pub struct SourceConfig {
    pub target: String,
    pub director_host: String,
    pub deployment: String,
    pub credentials: Credentials,
    pub ca_cert: Option<String>,
    pub jump_host: Option<JumpHost>,
    pub skip_check: bool,
}

impl SourceConfig {
    /// Secret values that must never appear in output.
    pub fn secrets(&self) -> Vec<String> {
        let mut secrets = vec![self.credentials.secret().to_string()];
        if let Some(jump) = &self.jump_host {
            secrets.push(jump.private_key.clone());
        }
        secrets
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawSource {
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    deployment: Option<String>,
    #[serde(default)]
    client: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    ca_cert: Option<String>,
    #[serde(default)]
    jumpbox_url: Option<String>,
    #[serde(default)]
    jumpbox_ssh_key: Option<String>,
    #[serde(default)]
    jumpbox_username: Option<String>,
    #[serde(default)]
    skip_check: bool,
}

impl TryFrom<RawSource> for SourceConfig {
    type Error = DeployResourceError;

    fn try_from(raw: RawSource) -> Result<Self> {
        let target = present(raw.target)
            .ok_or_else(|| DeployResourceError::Config("source.target is required".into()))?;
        let director = parse_endpoint(&target, "source.target", "https")?;
        if director.scheme != "https" && director.scheme != "http" {
            return Err(DeployResourceError::Config(format!(
                "source.target scheme '{}' is not supported (use https)",
                director.scheme
            )));
        }

        let deployment = present(raw.deployment)
            .ok_or_else(|| DeployResourceError::Config("source.deployment is required".into()))?;

        let credentials = match (
            present(raw.client),
            present(raw.client_secret),
            present(raw.username),
            present(raw.password),
        ) {
            (Some(id), Some(secret), None, None) => Credentials::Client { id, secret },
            (None, None, Some(username), Some(password)) => {
                Credentials::User { username, password }
            }
            (None, None, None, None) => {
                return Err(DeployResourceError::Config(
                    "source requires credentials: client/client_secret or username/password".into(),
                ));
            }
            _ => {
                return Err(DeployResourceError::Config(
                    "source must set exactly one credential scheme: client + client_secret, or username + password".into(),
                ));
            }
        };

        let jump_host = match (present(raw.jumpbox_url), present(raw.jumpbox_ssh_key)) {
            (None, None) => None,
            (Some(_), None) => {
                return Err(DeployResourceError::Config(
                    "source.jumpbox_ssh_key is required when source.jumpbox_url is set".into(),
                ));
            }
            (None, Some(_)) => {
                return Err(DeployResourceError::Config(
                    "source.jumpbox_ssh_key is set but source.jumpbox_url is missing".into(),
                ));
            }
            (Some(url), Some(private_key)) => {
                let endpoint = parse_endpoint(&url, "source.jumpbox_url", "ssh")?;
                if endpoint.scheme != "ssh" {
                    return Err(DeployResourceError::Config(format!(
                        "source.jumpbox_url scheme '{}' is not supported",
                        endpoint.scheme
                    )));
                }
                Some(JumpHost {
                    host: endpoint.host,
                    port: endpoint.port.unwrap_or(DEFAULT_SSH_PORT),
                    username: present(raw.jumpbox_username)
                        .unwrap_or_else(|| DEFAULT_JUMPBOX_USER.to_string()),
                    private_key,
                })
            }
        };

        Ok(Self {
            target,
            director_host: director.host,
            deployment,
            credentials,
            ca_cert: present(raw.ca_cert),
            jump_host,
            skip_check: raw.skip_check,
        })
    }
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    scheme: String,
    host: String,
    port: Option<u16>,
}

/// Parses `host`, `host:port`, `[v6]:port` or a full URL. Scheme-less input gets `default_scheme`.
fn parse_endpoint(input: &str, field: &str, default_scheme: &str) -> Result<Endpoint> {
    let invalid = |reason: &str| {
        DeployResourceError::Config(format!("{field} '{input}' is not a valid endpoint: {reason}"))
    };

    let trimmed = input.trim();
    if trimmed.chars().any(char::is_whitespace) {
        return Err(invalid("contains whitespace"));
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{default_scheme}://{trimmed}")
    };
    let url = Url::parse(&candidate).map_err(|err| invalid(&err.to_string()))?;

    if !url.username().is_empty() || url.password().is_some() {
        return Err(invalid("credentials must not be embedded in the address"));
    }
    let host = match url.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
        _ => return Err(invalid("missing host")),
    };
    if url.port() == Some(0) {
        return Err(invalid("port must be a number between 1 and 65535"));
    }

    Ok(Endpoint {
        scheme: url.scheme().to_string(),
        host,
        port: url.port(),
    })
}

/// Delete switch for `out`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub force: bool,
}

/// Parameters of an `out` step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<PathBuf>,
    #[serde(default)]
    pub no_redact: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<u32>,
    #[serde(default)]
    pub recreate: bool,
    #[serde(default)]
    pub skip_drain: Vec<String>,
    #[serde(default)]
    pub cleanup: bool,
    #[serde(default)]
    pub releases: Vec<PathBuf>,
    #[serde(default)]
    pub stemcells: Vec<PathBuf>,
    #[serde(default)]
    pub vars: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub vars_files: Vec<PathBuf>,
    #[serde(default)]
    pub var_files: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub ops_files: Vec<PathBuf>,
    #[serde(default)]
    pub delete: DeleteParams,
}

impl OutParams {
    pub fn validate(&self) -> Result<()> {
        if self.delete.force && !self.delete.enabled {
            return Err(DeployResourceError::Config(
                "params.delete.force requires params.delete.enabled".into(),
            ));
        }
        if !self.delete.enabled && self.manifest.is_none() {
            return Err(DeployResourceError::Config(
                "params.manifest is required unless params.delete.enabled is set".into(),
            ));
        }
        if self.max_in_flight == Some(0) {
            return Err(DeployResourceError::Config(
                "params.max_in_flight must be greater than zero".into(),
            ));
        }
        if self.skip_drain.iter().any(|target| target.trim().is_empty()) {
            return Err(DeployResourceError::Config(
                "params.skip_drain entries must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Copy of the params with every relative path resolved against `root`.
    pub fn rooted_at(&self, root: &Path) -> Self {
        let join = |path: &PathBuf| -> PathBuf {
            if path.is_absolute() {
                path.clone()
            } else {
                root.join(path)
            }
        };

        Self {
            manifest: self.manifest.as_ref().map(join),
            releases: self.releases.iter().map(join).collect(),
            stemcells: self.stemcells.iter().map(join).collect(),
            vars_files: self.vars_files.iter().map(join).collect(),
            var_files: self
                .var_files
                .iter()
                .map(|(name, path)| (name.clone(), join(path)))
                .collect(),
            ops_files: self.ops_files.iter().map(join).collect(),
            ..self.clone()
        }
    }
}
