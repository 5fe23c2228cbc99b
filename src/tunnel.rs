//! Optional SOCKS5 tunnel through an SSH jump host.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh_keys::key::{KeyPair, PublicKey};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::{JumpHost, SourceConfig};
use crate::error::{DeployResourceError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const SOCKS_VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const NO_ACCEPTABLE_METHOD: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// A live (or no-op) tunnel. Closing is idempotent and also happens on drop.
pub struct Tunnel {
    proxy_addr: Option<SocketAddr>,
    task: Mutex<Option<JoinHandle<()>>>,
    warnings: Vec<String>,
}

impl Tunnel {
    /// Director reachable directly; nothing to tear down.
    pub fn direct() -> Self {
        Self {
            proxy_addr: None,
            task: Mutex::new(None),
            warnings: Vec::new(),
        }
    }

    /// Binds a local SOCKS5 listener that reaches targets through `dialer`.
    pub async fn serve(dialer: Arc<dyn Dialer>, warnings: Vec<String>) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let proxy_addr = listener.local_addr()?;
        let task = tokio::spawn(serve_socks5(listener, dialer));
        Ok(Self {
            proxy_addr: Some(proxy_addr),
            task: Mutex::new(Some(task)),
            warnings,
        })
    }

    pub fn proxy_addr(&self) -> Option<SocketAddr> {
        self.proxy_addr
    }

    pub fn proxy_url(&self) -> Option<String> {
        self.proxy_addr.map(|addr| format!("socks5://{addr}"))
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn is_closed(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }

    pub fn close(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            // Connection tasks live in a JoinSet owned by this task and are aborted with it.
            task.abort();
            debug!(proxy = ?self.proxy_addr, "tunnel closed");
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens the channel used to reach the director for one invocation.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    async fn open(&self, source: &SourceConfig) -> Result<Tunnel>;
}

/// Best-effort discovery of a jump host's SSH key fingerprint.
#[async_trait]
pub trait HostKeyResolver: Send + Sync {
    async fn resolve(&self, jump: &JumpHost) -> Result<String>;
}

/// Outcome of the host-key lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyCheck {
    Pinned(String),
    Unverified { warning: String },
}

impl HostKeyCheck {
    /// Lookup failure degrades to an unpinned connection and a warning.
    pub fn from_lookup(address: &str, lookup: Result<String>) -> Self {
        match lookup {
            Ok(fingerprint) => HostKeyCheck::Pinned(fingerprint),
            Err(err) => HostKeyCheck::Unverified {
                warning: format!(
                    "could not resolve host key of jump host {address} ({err}); continuing without host key pinning"
                ),
            },
        }
    }

    pub fn warning(&self) -> Option<&str> {
        match self {
            HostKeyCheck::Pinned(_) => None,
            HostKeyCheck::Unverified { warning } => Some(warning),
        }
    }

    fn expected(&self) -> Option<String> {
        match self {
            HostKeyCheck::Pinned(fingerprint) => Some(fingerprint.clone()),
            HostKeyCheck::Unverified { .. } => None,
        }
    }
}

/// Authenticated session to the jump host, exposed as a dialer for the SOCKS5 listener.
#[async_trait]
pub trait JumpConnector: Send + Sync {
    async fn establish(
        &self,
        jump: &JumpHost,
        key: KeyPair,
        host_key: &HostKeyCheck,
    ) -> Result<Arc<dyn Dialer>>;
}

/// Public-key SSH login; direct-tcpip channels carry the proxied connections.
pub struct SshJumpConnector;

#[async_trait]
impl JumpConnector for SshJumpConnector {
    async fn establish(
        &self,
        jump: &JumpHost,
        key: KeyPair,
        host_key: &HostKeyCheck,
    ) -> Result<Arc<dyn Dialer>> {
        let address = jump.address();
        let handler = PinnedHostKey {
            expected: host_key.expected(),
        };
        let mut handle = connect(jump, handler).await?;
        let authenticated = handle
            .authenticate_publickey(jump.username.clone(), Arc::new(key))
            .await
            .map_err(|err| connectivity(&address, err))?;
        if !authenticated {
            return Err(DeployResourceError::Connectivity {
                target: address,
                message: format!("public key authentication rejected for user '{}'", jump.username),
            });
        }
        Ok(Arc::new(SshDialer {
            handle: Arc::new(tokio::sync::Mutex::new(handle)),
        }))
    }
}

/// Tunnels through `source.jump_host` when configured, otherwise returns a direct tunnel.
pub struct SshTunnelProvider {
    resolver: Arc<dyn HostKeyResolver>,
    connector: Arc<dyn JumpConnector>,
}

impl SshTunnelProvider {
    pub fn new(resolver: Arc<dyn HostKeyResolver>) -> Self {
        Self {
            resolver,
            connector: Arc::new(SshJumpConnector),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn JumpConnector>) -> Self {
        self.connector = connector;
        self
    }
}

impl Default for SshTunnelProvider {
    fn default() -> Self {
        Self::new(Arc::new(SshHostKeyResolver))
    }
}

#[async_trait]
impl TunnelProvider for SshTunnelProvider {
    async fn open(&self, source: &SourceConfig) -> Result<Tunnel> {
        let Some(jump) = &source.jump_host else {
            return Ok(Tunnel::direct());
        };
        let address = jump.address();

        let key = russh_keys::decode_secret_key(&jump.private_key, None).map_err(|err| {
            DeployResourceError::Config(format!(
                "source.jumpbox_ssh_key could not be parsed: {err}"
            ))
        })?;

        let host_key = HostKeyCheck::from_lookup(&address, self.resolver.resolve(jump).await);
        let mut warnings = Vec::new();
        if let Some(warning) = host_key.warning() {
            warn!("{warning}");
            warnings.push(warning.to_string());
        }

        let dialer = self.connector.establish(jump, key, &host_key).await?;
        let tunnel = Tunnel::serve(dialer, warnings).await?;
        info!(
            jump_host = %address,
            proxy = ?tunnel.proxy_addr(),
            "SOCKS5 tunnel ready"
        );
        Ok(tunnel)
    }
}

/// Captures the jump host's key with a throw-away connection.
pub struct SshHostKeyResolver;

#[async_trait]
impl HostKeyResolver for SshHostKeyResolver {
    async fn resolve(&self, jump: &JumpHost) -> Result<String> {
        let seen = Arc::new(Mutex::new(None));
        let handle = connect(jump, RecordHostKey { seen: seen.clone() }).await?;
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await;
        let fingerprint = seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        fingerprint.ok_or_else(|| DeployResourceError::Connectivity {
            target: jump.address(),
            message: "server did not present a host key".into(),
        })
    }
}

async fn connect<H>(jump: &JumpHost, handler: H) -> Result<client::Handle<H>>
where
    H: client::Handler<Error = russh::Error> + 'static,
{
    let address = jump.address();
    let config = Arc::new(client::Config::default());
    tokio::time::timeout(
        CONNECT_TIMEOUT,
        client::connect(config, (jump.host.as_str(), jump.port), handler),
    )
    .await
    .map_err(|_| DeployResourceError::Connectivity {
        target: address.clone(),
        message: format!("timed out after {}s", CONNECT_TIMEOUT.as_secs()),
    })?
    .map_err(|err| connectivity(&address, err))
}

fn connectivity(target: &str, err: impl std::fmt::Display) -> DeployResourceError {
    DeployResourceError::Connectivity {
        target: target.to_string(),
        message: err.to_string(),
    }
}

struct PinnedHostKey {
    expected: Option<String>,
}

#[async_trait]
impl client::Handler for PinnedHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(match &self.expected {
            Some(expected) => *expected == server_public_key.fingerprint(),
            None => true,
        })
    }
}

struct RecordHostKey {
    seen: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl client::Handler for RecordHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        *self
            .seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) =
            Some(server_public_key.fingerprint());
        Ok(true)
    }
}

pub trait ProxyStream: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send> ProxyStream for T {}

pub type ProxiedStream = Pin<Box<dyn ProxyStream>>;

/// Opens the upstream leg of a SOCKS5 CONNECT.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, host: &str, port: u16) -> io::Result<ProxiedStream>;
}

struct SshDialer {
    handle: Arc<tokio::sync::Mutex<client::Handle<PinnedHostKey>>>,
}

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<ProxiedStream> {
        let channel = self
            .handle
            .lock()
            .await
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|err| io::Error::other(err.to_string()))?;
        Ok(Box::pin(channel.into_stream()))
    }
}

async fn serve_socks5(listener: TcpListener, dialer: Arc<dyn Dialer>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let dialer = dialer.clone();
                    connections.spawn(async move {
                        if let Err(err) = handle_socks5(stream, dialer.as_ref()).await {
                            debug!(%peer, error = %err, "SOCKS5 connection ended with error");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "SOCKS5 accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn handle_socks5(mut client: TcpStream, dialer: &dyn Dialer) -> io::Result<()> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS_VERSION {
        return Err(invalid_data(format!("unsupported SOCKS version {}", greeting[0])));
    }
    let mut methods = vec![0u8; usize::from(greeting[1])];
    client.read_exact(&mut methods).await?;
    if !methods.contains(&NO_AUTH) {
        client
            .write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHOD])
            .await?;
        return Err(invalid_data("client offered no supported auth method"));
    }
    client.write_all(&[SOCKS_VERSION, NO_AUTH]).await?;

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(invalid_data(format!("unsupported SOCKS version {}", request[0])));
    }
    if request[1] != CMD_CONNECT {
        reply(&mut client, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(invalid_data(format!("unsupported SOCKS command {}", request[1])));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = client.read_u8().await?;
            let mut name = vec![0u8; usize::from(len)];
            client.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| invalid_data("domain name is not UTF-8"))?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            client.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            reply(&mut client, REPLY_ADDRESS_TYPE_NOT_SUPPORTED).await?;
            return Err(invalid_data(format!("unsupported address type {other}")));
        }
    };
    let port = client.read_u16().await?;

    let mut upstream = match dialer.dial(&host, port).await {
        Ok(stream) => stream,
        Err(err) => {
            reply(&mut client, REPLY_HOST_UNREACHABLE).await?;
            return Err(err);
        }
    };
    reply(&mut client, REPLY_SUCCEEDED).await?;
    debug!(%host, port, "SOCKS5 CONNECT established");

    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

async fn reply(client: &mut TcpStream, code: u8) -> io::Result<()> {
    client
        .write_all(&[SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}
