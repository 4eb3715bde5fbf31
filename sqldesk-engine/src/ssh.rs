//! SSH tunnel: local port forwarding to a database host
//!
//! The tunnel binds an ephemeral port on the loopback interface and opens a
//! `direct-tcpip` channel over one authenticated SSH session for every
//! connection the pool makes to it.

use crate::config::{EngineConfig, HostKeyPolicy};
use crate::profile::{SshAuthMode, SshTunnelConfig};
use crate::{Error, Result};
use russh::client::{self, Handle};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use std::io::{BufRead, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// A running tunnel
///
/// Dropping the tunnel stops the forwarder; [`SshTunnel::teardown`] also
/// disconnects the SSH session right away.
pub struct SshTunnel {
    host: String,
    local_addr: SocketAddr,
    session: Arc<Handle<TunnelHandler>>,
    shutdown: CancellationToken,
    torn_down: AtomicBool,
}

impl std::fmt::Debug for SshTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTunnel")
            .field("host", &self.host)
            .field("local_addr", &self.local_addr)
            .field("torn_down", &self.torn_down.load(Ordering::Acquire))
            .finish()
    }
}

impl SshTunnel {
    /// Connect, authenticate and start forwarding to `remote_host:remote_port`
    ///
    /// # Arguments
    ///
    /// * `ssh` - SSH host, port, user and auth mode
    /// * `passphrase` - Passphrase of the private key, for key auth
    /// * `remote_host` - Database host as seen from the SSH server
    /// * `remote_port` - Database port as seen from the SSH server
    /// * `config` - Dial timeout, keepalive and known_hosts settings
    pub async fn establish(
        ssh: &SshTunnelConfig,
        passphrase: Option<&str>,
        remote_host: &str,
        remote_port: u16,
        config: &EngineConfig,
    ) -> Result<Self> {
        let host = format!("{}:{}", ssh.host, ssh.port);

        // Load the key before dialing so a bad passphrase is reported as such
        let key = match &ssh.auth {
            SshAuthMode::Key { key_path } => Some(load_key(key_path, passphrase)?),
            SshAuthMode::Agent => None,
        };

        let russh_config = Arc::new(client::Config {
            keepalive_interval: Some(config.ssh_keepalive_interval),
            keepalive_max: config.ssh_keepalive_max,
            ..Default::default()
        });
        let handler = TunnelHandler {
            host: host.clone(),
            policy: config.host_key_policy(),
        };

        let connecting = client::connect(russh_config, (ssh.host.as_str(), ssh.port), handler);
        let mut session = tokio::time::timeout(config.connect_timeout, connecting)
            .await
            .map_err(|_| Error::TunnelUnreachable {
                host: host.clone(),
                cause: "timed out".to_string(),
            })?
            .map_err(|error| handshake_error(&host, error))?;

        let authenticated = match key {
            Some(key) => authenticate_key(&mut session, &ssh.username, key).await,
            None => authenticate_agent(&mut session, &ssh.username).await,
        }
        .map_err(|cause| Error::TunnelAuthFailed {
            host: host.clone(),
            cause,
        })?;
        if !authenticated {
            return Err(Error::TunnelAuthFailed {
                host,
                cause: format!("no key was accepted for user '{}'", ssh.username),
            });
        }

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|error| Error::TunnelUnreachable {
                host: host.clone(),
                cause: format!("could not bind a local port: {error}"),
            })?;
        let local_addr = listener.local_addr().map_err(|error| Error::TunnelUnreachable {
            host: host.clone(),
            cause: error.to_string(),
        })?;

        let session = Arc::new(session);
        let shutdown = CancellationToken::new();
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&session),
            shutdown.clone(),
            remote_host.to_string(),
            remote_port,
        ));

        tracing::info!(%host, %local_addr, remote_host, remote_port, "SSH tunnel established");
        Ok(Self {
            host,
            local_addr,
            session,
            shutdown,
            torn_down: AtomicBool::new(false),
        })
    }

    /// The loopback endpoint the pool dials instead of the database host
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Stop forwarding and close the SSH session; later calls do nothing
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown.cancel();
        if let Err(error) = self
            .session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!(host = %self.host, %error, "SSH session already gone");
        }
        tracing::info!(host = %self.host, "SSH tunnel torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    session: Arc<Handle<TunnelHandler>>,
    shutdown: CancellationToken,
    remote_host: String,
    remote_port: u16,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(forward(
                        Arc::clone(&session),
                        stream,
                        shutdown.clone(),
                        remote_host.clone(),
                        remote_port,
                    ));
                }
                Err(error) => {
                    tracing::error!(%error, "SSH tunnel accept failed");
                    break;
                }
            },
        }
    }
}

async fn forward(
    session: Arc<Handle<TunnelHandler>>,
    mut tcp: TcpStream,
    shutdown: CancellationToken,
    remote_host: String,
    remote_port: u16,
) {
    let channel = match session
        .channel_open_direct_tcpip(remote_host.as_str(), u32::from(remote_port), "127.0.0.1", 0)
        .await
    {
        Ok(channel) => channel,
        Err(error) => {
            tracing::error!(%remote_host, remote_port, %error, "SSH tunnel could not open a channel");
            return;
        }
    };

    let mut channel = channel.into_stream();
    tokio::select! {
        _ = shutdown.cancelled() => {}
        copied = copy_bidirectional(&mut tcp, &mut channel) => {
            if let Err(error) = copied {
                tracing::error!(%remote_host, remote_port, %error, "SSH tunnel forward failed");
            }
        }
    }
}

fn load_key(key_path: &Path, passphrase: Option<&str>) -> Result<russh::keys::PrivateKey> {
    russh::keys::load_secret_key(key_path, passphrase).map_err(|error| Error::KeyDecryptFailed {
        key_path: key_path.display().to_string(),
        cause: error.to_string(),
    })
}

async fn authenticate_key(
    session: &mut Handle<TunnelHandler>,
    username: &str,
    key: russh::keys::PrivateKey,
) -> std::result::Result<bool, String> {
    let hash = session
        .best_supported_rsa_hash()
        .await
        .map_err(|error| error.to_string())?
        .flatten();

    let result = session
        .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::new(key), hash))
        .await
        .map_err(|error| error.to_string())?;
    Ok(result.success())
}

async fn authenticate_agent(
    session: &mut Handle<TunnelHandler>,
    username: &str,
) -> std::result::Result<bool, String> {
    use russh::keys::agent::client::AgentClient;

    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|error| format!("SSH agent unavailable: {error}"))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|error| format!("SSH agent did not list identities: {error}"))?;

    for identity in identities {
        let hash = session
            .best_supported_rsa_hash()
            .await
            .map_err(|error| error.to_string())?
            .flatten();

        let result = session
            .authenticate_publickey_with(username, identity, hash, &mut agent)
            .await
            .map_err(|error| error.to_string())?;
        if result.success() {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Failures during the SSH handshake
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error("host key of {0} does not match known_hosts")]
    HostKeyMismatch(String),

    #[error("known_hosts: {0}")]
    KnownHosts(#[from] std::io::Error),

    #[error("no known_hosts file to verify the host key of {0} against")]
    Unverifiable(String),
}

/// Host key problems are authentication failures, everything else means the
/// host could not be reached
fn handshake_error(host: &str, error: HandshakeError) -> Error {
    match error {
        HandshakeError::HostKeyMismatch(_)
        | HandshakeError::KnownHosts(_)
        | HandshakeError::Unverifiable(_) => {
            Error::TunnelAuthFailed {
                host: host.to_string(),
                cause: error.to_string(),
            }
        }
        HandshakeError::Ssh(_) => Error::TunnelUnreachable {
            host: host.to_string(),
            cause: error.to_string(),
        },
    }
}

pub struct TunnelHandler {
    /// `host:port` key in known_hosts
    host: String,
    policy: HostKeyPolicy,
}

impl client::Handler for TunnelHandler {
    type Error = HandshakeError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let encoded = server_public_key
            .to_openssh()
            .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string()))?;
        check_host_key(&self.policy, &self.host, &encoded)
    }
}

fn check_host_key(
    policy: &HostKeyPolicy,
    host: &str,
    encoded: &str,
) -> std::result::Result<bool, HandshakeError> {
    let known_hosts = match policy {
        HostKeyPolicy::TrustOnFirstUse(path) => path,
        HostKeyPolicy::AcceptAny => {
            tracing::warn!(%host, "Accepting SSH host key without verification");
            return Ok(true);
        }
        HostKeyPolicy::Reject => return Err(HandshakeError::Unverifiable(host.to_string())),
    };

    match verify_host_key(known_hosts, host, encoded)? {
        HostKey::Known => Ok(true),
        HostKey::Added => {
            tracing::info!(%host, "Added SSH host key to known_hosts");
            Ok(true)
        }
        HostKey::Changed => Err(HandshakeError::HostKeyMismatch(host.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostKey {
    Known,
    Added,
    Changed,
}

/// Trust on first use: unknown hosts are appended, known hosts must match
///
/// `encoded` is the OpenSSH rendering, `"<type> <base64> [comment]"`.
fn verify_host_key(known_hosts: &Path, host: &str, encoded: &str) -> std::io::Result<HostKey> {
    let mut fields = encoded.split_whitespace();
    let key_type = fields.next().unwrap_or_default();
    let key_data = fields.next().unwrap_or_default();

    if known_hosts.exists() {
        let file = std::fs::File::open(known_hosts)?;
        for line in std::io::BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            if fields.next() != Some(host) {
                continue;
            }
            let known = fields.next() == Some(key_type) && fields.next() == Some(key_data);
            return Ok(if known { HostKey::Known } else { HostKey::Changed });
        }
    }

    if let Some(parent) = known_hosts.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(known_hosts)?;
    writeln!(file, "{host} {key_type} {key_data}")?;

    Ok(HostKey::Added)
}
