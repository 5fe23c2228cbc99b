use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::config::SourceConfig;
use crate::error::{DeployResourceError, Result};
use crate::redact::Redactor;
use crate::tunnel::{Tunnel, TunnelProvider};

const CLI_BINARY: &str = "bosh";
const STANDARD_LOCATIONS: &[&str] = &["/usr/local/bin/bosh", "/usr/bin/bosh", "/opt/resource/bosh"];

/// Materializes what one bosh invocation needs and owns the tunnel for its duration.
pub struct CliCoordinator {
    source: SourceConfig,
    tunnels: Arc<dyn TunnelProvider>,
    cli_path: Option<PathBuf>,
    temp_root: Option<PathBuf>,
}

impl CliCoordinator {
    pub fn new(source: SourceConfig, tunnels: Arc<dyn TunnelProvider>) -> Self {
        Self {
            source,
            tunnels,
            cli_path: None,
            temp_root: None,
        }
    }

    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    pub fn with_temp_root(mut self, root: Option<PathBuf>) -> Self {
        self.temp_root = root;
        self
    }

    pub fn source(&self) -> &SourceConfig {
        &self.source
    }

    /// Explicit path, then PATH, then the standard install locations.
    pub fn resolve_cli(&self) -> Result<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.is_file() {
                return Ok(path.clone());
            }
            return Err(DeployResourceError::CliMissing {
                searched: path.display().to_string(),
            });
        }
        if let Ok(path) = which::which(CLI_BINARY) {
            return Ok(path);
        }
        if let Some(path) = STANDARD_LOCATIONS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.is_file())
        {
            return Ok(path);
        }
        Err(DeployResourceError::CliMissing {
            searched: format!("PATH, {}", STANDARD_LOCATIONS.join(", ")),
        })
    }

    pub async fn open_session(&self) -> Result<Session> {
        let cli = self.resolve_cli()?;
        let tunnel = self.tunnels.open(&self.source).await?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("bosh-session-");
        // Early returns from here on drop `tunnel`, which closes it.
        let workdir = match &self.temp_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };

        let mut session = Session {
            cli,
            env: BTreeMap::new(),
            root: workdir.path().to_path_buf(),
            workdir: Mutex::new(Some(workdir)),
            tunnel,
            redactor: Redactor::new(self.source.secrets())?,
            closed: AtomicBool::new(false),
        };

        session.set_env("BOSH_ENVIRONMENT", &self.source.target);
        session.set_env("BOSH_CLIENT", self.source.credentials.identity());
        session.set_env("BOSH_CLIENT_SECRET", self.source.credentials.secret());
        session.set_env("BOSH_DEPLOYMENT", &self.source.deployment);
        session.set_env("BOSH_NON_INTERACTIVE", "true");

        if let Some(ca_cert) = &self.source.ca_cert {
            let path = session.write_private_file("ca.pem", ca_cert.as_bytes())?;
            session.set_env("BOSH_CA_CERT", &path.display().to_string());
        }
        if let Some(proxy) = session.tunnel.proxy_url() {
            session.set_env("BOSH_ALL_PROXY", &proxy);
        }

        info!(
            deployment = %self.source.deployment,
            director = %self.source.director_host,
            tunneled = session.tunnel.proxy_addr().is_some(),
            "bosh session opened"
        );
        Ok(session)
    }
}

/// On-disk artifacts, environment and tunnel for one operation. Torn down exactly once.
pub struct Session {
    cli: PathBuf,
    env: BTreeMap<String, String>,
    root: PathBuf,
    workdir: Mutex<Option<TempDir>>,
    tunnel: Tunnel,
    redactor: Redactor,
    closed: AtomicBool,
}

impl Session {
    pub fn cli(&self) -> &Path {
        &self.cli
    }

    /// Variables passed to every spawned CLI process, never to the parent environment.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    /// Redactor for the credentials this session carries.
    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_env(&mut self, key: &str, value: &str) {
        self.env.insert(key.to_string(), value.to_string());
    }

    /// Writes a file readable only by the current user inside the session directory.
    pub fn write_private_file(&self, name: &str, contents: &[u8]) -> Result<PathBuf> {
        if self.is_closed() {
            return Err(DeployResourceError::Other(format!(
                "cannot write {name}: session already closed"
            )));
        }
        let path = self.root.join(name);
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path)?;
        file.write_all(contents)?;
        file.flush()?;
        debug!(path = %path.display(), "materialized session file");
        Ok(path)
    }

    /// Removes temporary files, then closes the tunnel. Safe to call any number of times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let workdir = self
            .workdir
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(workdir) = workdir
            && let Err(err) = workdir.close()
        {
            warn!(path = %self.root.display(), error = %err, "failed to remove session directory");
        }
        self.tunnel.close();
        info!("bosh session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
