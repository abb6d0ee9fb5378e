//! SSH tunnel for servers that are only reachable through a bastion host.
//!
//! [`TunnelController`] owns at most one forwarder per server manager. The forwarder
//! itself sits behind [`TunnelForwarder`]; [`SshForwarder`] is the russh implementation
//! that listens on `127.0.0.1:<ephemeral>` and opens a `direct-tcpip` channel per
//! accepted local connection.

use crate::error::{PgDeckError, PgDeckResult};
use crate::models::{Secret, ServerIdentity, TunnelAuth, TunnelSettings};
use crate::services::secrets::SecretService;
use async_trait::async_trait;
use russh::client;
use russh_keys::agent::client::AgentClient;
use russh_keys::key::KeyPair;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Loopback address the tunnel listens on.
pub const LOCAL_BIND_HOST: &str = "127.0.0.1";

const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);

/// Where a tunnel goes and how it authenticates.
#[derive(Debug, Clone)]
pub struct ForwardSpec {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub username: String,
    pub auth: TunnelAuth,
    /// Database host as seen from the SSH server
    pub remote_host: String,
    pub remote_port: u16,
}

impl ForwardSpec {
    /// Forward to the identity's database server through its tunnel settings.
    pub fn new(identity: &ServerIdentity, tunnel: &TunnelSettings) -> Self {
        let remote_host = identity.hostaddr.clone().unwrap_or_else(|| identity.host.clone());
        Self {
            ssh_host: tunnel.host.clone(),
            ssh_port: tunnel.port,
            username: tunnel.username.clone(),
            auth: tunnel.auth.clone(),
            remote_host,
            remote_port: identity.port,
        }
    }
}

/// Opens tunnels.
#[async_trait]
pub trait TunnelForwarder: Send + Sync {
    /// Start forwarding. `password` is the SSH password or key passphrase.
    async fn open(
        &self,
        spec: &ForwardSpec,
        password: Option<&str>,
    ) -> PgDeckResult<Box<dyn ActiveTunnel>>;
}

/// A running tunnel.
pub trait ActiveTunnel: Send + Sync {
    /// Local port accepting connections.
    fn local_port(&self) -> u16;

    /// Whether the SSH session is still up.
    fn is_active(&self) -> bool;

    /// Stop forwarding.
    fn stop(&self);
}

/// The single tunnel of one server manager.
pub struct TunnelController {
    forwarder: Arc<dyn TunnelForwarder>,
    secrets: Arc<dyn SecretService>,
    handle: Option<Box<dyn ActiveTunnel>>,
    local_bind_port: u16,
    created: bool,
}

impl TunnelController {
    pub fn new(forwarder: Arc<dyn TunnelForwarder>, secrets: Arc<dyn SecretService>) -> Self {
        Self { forwarder, secrets, handle: None, local_bind_port: 0, created: false }
    }

    /// Whether a tunnel has been created and not stopped since.
    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Local bind host.
    pub fn local_bind_host(&self) -> &'static str {
        LOCAL_BIND_HOST
    }

    /// Local bind port, valid once created.
    pub fn local_bind_port(&self) -> Option<u16> {
        self.created.then_some(self.local_bind_port)
    }

    /// Create the tunnel for `identity`.
    ///
    /// A tunnel password that cannot be decrypted because the key is missing yields
    /// `CryptKeyMissing`; every other failure is an `Ssh` error with a readable message.
    pub async fn create(
        &mut self,
        identity: &ServerIdentity,
        tunnel_password: Option<&Secret>,
    ) -> PgDeckResult<()> {
        let tunnel = identity
            .tunnel
            .as_ref()
            .ok_or_else(|| PgDeckError::ssh("Server is not configured for SSH tunneling"))?;

        if let TunnelAuth::IdentityFile { path: None } = tunnel.auth {
            return Err(PgDeckError::ssh("Identity file is required for key authentication"));
        }

        let password = match tunnel_password {
            Some(secret) => {
                let key = self.secrets.crypt_key().ok_or(PgDeckError::CryptKeyMissing)?;
                let text = self.secrets.decrypt(secret, &key).map_err(|e| {
                    PgDeckError::ssh(format!("Failed to decrypt the tunnel password: {e}"))
                })?;
                Some(text)
            }
            None => None,
        };

        // Drop any stale forwarder first.
        self.stop();

        let spec = ForwardSpec::new(identity, tunnel);
        tracing::info!(
            server_id = identity.id,
            tunnel_host = %spec.ssh_host,
            tunnel_port = spec.ssh_port,
            auth = spec.auth.as_str(),
            "Creating SSH tunnel"
        );

        let handle = self.forwarder.open(&spec, password.as_deref()).await?;
        self.local_bind_port = handle.local_port();
        self.handle = Some(handle);
        self.created = true;

        tracing::info!(
            server_id = identity.id,
            local_port = self.local_bind_port,
            "SSH tunnel created"
        );
        Ok(())
    }

    /// Fail with `SshTunnelConnectionLost` if the tunnel is absent or dead.
    pub fn check_alive(&mut self, tunnel_host: &str) -> PgDeckResult<()> {
        let alive = self.handle.as_ref().is_some_and(|h| h.is_active());
        if !alive {
            tracing::warn!(tunnel_host, "SSH tunnel is not alive");
            self.created = false;
            return Err(PgDeckError::tunnel_lost(tunnel_host));
        }
        Ok(())
    }

    /// Tear the tunnel down. Safe when already stopped.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop();
            tracing::debug!(local_port = self.local_bind_port, "SSH tunnel stopped");
        }
        self.created = false;
        self.local_bind_port = 0;
    }
}

impl Drop for TunnelController {
    fn drop(&mut self) {
        self.stop();
    }
}

// ========== russh forwarder ==========

/// russh client handler.
struct SshClientHandler {
    host: String,
    port: u16,
}

#[async_trait]
impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    /// Checked against the user's `~/.ssh/known_hosts`. A key that contradicts a recorded
    /// one is refused; a host with no entry is trusted on first use, nothing is recorded.
    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let lookup = russh_keys::check_known_hosts(&self.host, self.port, server_public_key);
        Ok(accept_host_key(&self.host, self.port, lookup))
    }
}

/// Whether to trust a server key given its known_hosts lookup.
fn accept_host_key(host: &str, port: u16, lookup: Result<bool, russh_keys::Error>) -> bool {
    match lookup {
        Ok(true) => {
            tracing::debug!(host, port, "SSH host key matches known_hosts");
            true
        }
        Ok(false) => {
            tracing::warn!(host, port, "SSH host is not in known_hosts, accepting its key");
            true
        }
        Err(russh_keys::Error::KeyChanged { line }) => {
            tracing::error!(host, port, line, "SSH host key differs from known_hosts");
            false
        }
        Err(e) => {
            tracing::warn!(host, port, error = %e, "Cannot check known_hosts, accepting the key");
            true
        }
    }
}

/// Tunnel forwarder backed by russh.
#[derive(Debug, Default)]
pub struct SshForwarder;

impl SshForwarder {
    pub fn new() -> Self {
        Self
    }

    async fn connect_ssh(
        spec: &ForwardSpec,
        password: Option<&str>,
    ) -> PgDeckResult<client::Handle<SshClientHandler>> {
        let config = Arc::new(client::Config::default());
        let target = (spec.ssh_host.as_str(), spec.ssh_port);

        let handler = SshClientHandler { host: spec.ssh_host.clone(), port: spec.ssh_port };
        let connect = client::connect(config, target, handler);
        let mut handle = tokio::time::timeout(SSH_CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| {
                PgDeckError::ssh(format!(
                    "Timed out connecting to SSH server {}:{}",
                    spec.ssh_host, spec.ssh_port
                ))
            })?
            .map_err(|e| {
                PgDeckError::ssh_with_source(
                    format!(
                        "Failed to connect to SSH server {}:{}: {e}",
                        spec.ssh_host, spec.ssh_port
                    ),
                    e,
                )
            })?;

        let authenticated = match &spec.auth {
            TunnelAuth::Password => {
                let password =
                    password.ok_or_else(|| PgDeckError::ssh("SSH password not provided"))?;
                handle.authenticate_password(&spec.username, password).await.map_err(|e| {
                    PgDeckError::ssh(format!("SSH password authentication failed: {e}"))
                })?
            }
            TunnelAuth::IdentityFile { path } => {
                let path = path
                    .as_deref()
                    .ok_or_else(|| PgDeckError::ssh("Identity file is required"))?;
                let key = load_private_key(path, password).await?;
                handle
                    .authenticate_publickey(&spec.username, key)
                    .await
                    .map_err(|e| PgDeckError::ssh(format!("SSH key authentication failed: {e}")))?
            }
            TunnelAuth::Agent => authenticate_with_agent(&mut handle, &spec.username).await?,
        };

        if !authenticated {
            return Err(PgDeckError::ssh(format!(
                "SSH authentication failed for {}@{}",
                spec.username, spec.ssh_host
            )));
        }

        tracing::debug!(
            user = %spec.username,
            host = %spec.ssh_host,
            "SSH authentication successful"
        );
        Ok(handle)
    }
}

#[async_trait]
impl TunnelForwarder for SshForwarder {
    async fn open(
        &self,
        spec: &ForwardSpec,
        password: Option<&str>,
    ) -> PgDeckResult<Box<dyn ActiveTunnel>> {
        let ssh_client = Self::connect_ssh(spec, password).await?;
        let ssh_client = Arc::new(Mutex::new(ssh_client));

        let listener = TcpListener::bind((LOCAL_BIND_HOST, 0)).await.map_err(|e| {
            PgDeckError::ssh(format!("Failed to bind local port for SSH tunnel: {e}"))
        })?;
        let local_port = listener.local_addr()?.port();

        let cancel_token = CancellationToken::new();
        let active = Arc::new(AtomicBool::new(true));

        tokio::spawn(run_tunnel(
            listener,
            ssh_client,
            spec.remote_host.clone(),
            spec.remote_port,
            cancel_token.clone(),
            active.clone(),
        ));

        Ok(Box::new(SshTunnelHandle { local_port, cancel_token, active }))
    }
}

/// Handle to a running russh tunnel.
struct SshTunnelHandle {
    local_port: u16,
    cancel_token: CancellationToken,
    active: Arc<AtomicBool>,
}

impl ActiveTunnel for SshTunnelHandle {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.cancel_token.is_cancelled()
    }

    fn stop(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for SshTunnelHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn load_private_key(path: &Path, passphrase: Option<&str>) -> PgDeckResult<Arc<KeyPair>> {
    let key_data = tokio::fs::read(path).await.map_err(|e| {
        PgDeckError::ssh(format!("Failed to read SSH key file {}: {e}", path.display()))
    })?;

    let key = russh_keys::decode_secret_key(&String::from_utf8_lossy(&key_data), passphrase)
        .map_err(|e| match passphrase {
            Some(_) => PgDeckError::ssh(format!("Failed to decrypt SSH key: {e}")),
            None => PgDeckError::ssh(format!("Failed to parse SSH key (passphrase needed?): {e}")),
        })?;

    Ok(Arc::new(key))
}

#[cfg(unix)]
async fn authenticate_with_agent(
    handle: &mut client::Handle<SshClientHandler>,
    username: &str,
) -> PgDeckResult<bool> {
    let socket_path = std::env::var("SSH_AUTH_SOCK")
        .map_err(|_| PgDeckError::ssh("SSH agent not available (SSH_AUTH_SOCK not set)"))?;
    let stream = tokio::net::UnixStream::connect(&socket_path)
        .await
        .map_err(|e| PgDeckError::ssh(format!("Failed to connect to SSH agent: {e}")))?;

    try_agent_identities(handle, username, AgentClient::connect(stream)).await
}

#[cfg(windows)]
async fn authenticate_with_agent(
    handle: &mut client::Handle<SshClientHandler>,
    username: &str,
) -> PgDeckResult<bool> {
    use tokio::net::windows::named_pipe::ClientOptions;

    let pipe = ClientOptions::new()
        .open(r"\\.\pipe\openssh-ssh-agent")
        .map_err(|e| PgDeckError::ssh(format!("Failed to connect to SSH agent: {e}")))?;

    try_agent_identities(handle, username, AgentClient::connect(pipe)).await
}

async fn try_agent_identities<S>(
    handle: &mut client::Handle<SshClientHandler>,
    username: &str,
    mut agent: AgentClient<S>,
) -> PgDeckResult<bool>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| PgDeckError::ssh(format!("Failed to list SSH agent identities: {e}")))?;

    if identities.is_empty() {
        return Err(PgDeckError::ssh("No identities available in SSH agent"));
    }

    for identity in identities {
        let (returned_agent, result) =
            handle.authenticate_future(username, identity.clone(), agent).await;
        agent = returned_agent;
        match result {
            Ok(true) => return Ok(true),
            Ok(false) => tracing::debug!("SSH agent key rejected, trying next"),
            Err(e) => tracing::debug!(error = %e, "SSH agent authentication error, trying next"),
        }
    }

    Ok(false)
}

async fn run_tunnel(
    listener: TcpListener,
    ssh_client: Arc<Mutex<client::Handle<SshClientHandler>>>,
    remote_host: String,
    remote_port: u16,
    cancel_token: CancellationToken,
    active: Arc<AtomicBool>,
) {
    let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((local_stream, peer_addr)) => {
                        tracing::debug!(%peer_addr, "New tunnel connection");
                        let ssh_client = ssh_client.clone();
                        let remote_host = remote_host.clone();
                        let cancel = cancel_token.clone();
                        tokio::spawn(async move {
                            if let Err(e) = forward_connection(
                                local_stream,
                                ssh_client,
                                &remote_host,
                                remote_port,
                                cancel,
                            )
                            .await
                            {
                                tracing::warn!(error = %e, "Tunnel forwarding error");
                            }
                        });
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to accept tunnel connection"),
                }
            }
            _ = liveness.tick() => {
                if ssh_client.lock().await.is_closed() {
                    tracing::warn!(%remote_host, "SSH session closed by peer");
                    break;
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }

    active.store(false, Ordering::SeqCst);
    let client = ssh_client.lock().await;
    if let Err(e) = client.disconnect(russh::Disconnect::ByApplication, "", "English").await {
        tracing::debug!(%remote_host, error = %e, "SSH disconnect failed");
    }
}

async fn forward_connection(
    mut local_stream: TcpStream,
    ssh_client: Arc<Mutex<client::Handle<SshClientHandler>>>,
    remote_host: &str,
    remote_port: u16,
    cancel_token: CancellationToken,
) -> PgDeckResult<()> {
    let channel = {
        let handle = ssh_client.lock().await;
        handle
            .channel_open_direct_tcpip(remote_host, u32::from(remote_port), LOCAL_BIND_HOST, 0)
            .await
            .map_err(|e| PgDeckError::ssh(format!("Failed to open SSH channel: {e}")))?
    };

    let mut channel = channel.into_stream();
    let mut buf_local = [0u8; 8192];
    let mut buf_remote = [0u8; 8192];

    loop {
        tokio::select! {
            n = local_stream.read(&mut buf_local) => match n {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if channel.write_all(&buf_local[..n]).await.is_err() {
                        break;
                    }
                }
            },
            n = channel.read(&mut buf_remote) => match n {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if local_stream.write_all(&buf_remote[..n]).await.is_err() {
                        break;
                    }
                }
            },
            _ = cancel_token.cancelled() => break,
        }
    }

    Ok(())
}
