//! SSH local port forwarding keyed by connection id.
//!
//! Each tunnel owns an authenticated russh session and a loopback listener on
//! an OS-assigned port. Every accepted socket gets its own `direct-tcpip`
//! channel to the remote database endpoint.

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use russh::client;
use russh::Disconnect;
use russh_keys::key::KeyPair;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{QueryPadError, Result};
use crate::models::SshConfig;

/// Limit for opening and authenticating an SSH session.
const SESSION_TIMEOUT: Duration = Duration::from_secs(10);

const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(50);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause before the next `accept()` after `failures` consecutive errors.
fn accept_backoff(failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    ACCEPT_BACKOFF_BASE.saturating_mul(factor).min(ACCEPT_BACKOFF_MAX)
}

/// What to forward and how to authenticate.
///
/// `secret` is the SSH password, or the key passphrase when a key path is set.
/// It is used for the duration of [`TunnelManager::create_tunnel`] only.
#[derive(Clone, Copy)]
pub struct TunnelRequest<'a> {
    /// SSH server and credentials reference
    pub ssh: &'a SshConfig,
    /// Database host as seen from the SSH server
    pub remote_host: &'a str,
    /// Database port as seen from the SSH server
    pub remote_port: u16,
    /// Password or key passphrase
    pub secret: Option<&'a str>,
}

impl std::fmt::Debug for TunnelRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRequest")
            .field("ssh", &self.ssh)
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .field("secret", &self.secret.map(|_| "<redacted>"))
            .finish()
    }
}

/// Resolved authentication material.
enum SshAuth {
    Key(Arc<KeyPair>),
    Password(String),
}

/// Key path wins over password; neither is a configuration error.
async fn resolve_auth(ssh: &SshConfig, secret: Option<&str>) -> Result<SshAuth> {
    if let Some(path) = &ssh.private_key_path {
        return load_private_key(path, secret).await.map(SshAuth::Key);
    }
    match secret {
        Some(password) if !password.is_empty() => Ok(SshAuth::Password(password.to_string())),
        _ => Err(QueryPadError::auth_config(
            "SSH tunnel requires a password or a private key path",
        )),
    }
}

/// Load a private key, retrying with the secret as passphrase.
async fn load_private_key(path: &Path, passphrase: Option<&str>) -> Result<Arc<KeyPair>> {
    let pem = tokio::fs::read_to_string(path).await.map_err(|e| {
        QueryPadError::auth_config(format!("Failed to read SSH key {}: {e}", path.display()))
    })?;

    let key = match russh_keys::decode_secret_key(&pem, None) {
        Ok(key) => key,
        Err(plain_err) => match passphrase {
            Some(passphrase) => russh_keys::decode_secret_key(&pem, Some(passphrase))
                .map_err(|e| QueryPadError::auth_config(format!("Failed to decrypt SSH key: {e}")))?,
            None => {
                return Err(QueryPadError::auth_config(format!(
                    "Failed to parse SSH key: {plain_err}"
                )))
            }
        },
    };

    Ok(Arc::new(key))
}

/// russh client callbacks.
struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // TODO: verify against ~/.ssh/known_hosts
        Ok(true)
    }
}

type Session = client::Handle<ClientHandler>;

async fn open_session(ssh: &SshConfig, auth: SshAuth) -> Result<Session> {
    let config = Arc::new(client::Config::default());
    let mut session = client::connect(config, (ssh.host.as_str(), ssh.port), ClientHandler)
        .await
        .map_err(|e| {
            QueryPadError::tunnel_with_source(
                format!("Failed to connect to SSH server {}:{}: {e}", ssh.host, ssh.port),
                e,
            )
        })?;

    let authenticated = match auth {
        SshAuth::Key(key) => session.authenticate_publickey(&ssh.username, key).await?,
        SshAuth::Password(password) => session.authenticate_password(&ssh.username, password).await?,
    };

    if !authenticated {
        let _ = session.disconnect(Disconnect::ByApplication, "", "en").await;
        return Err(QueryPadError::tunnel(format!(
            "SSH authentication failed for {}@{}",
            ssh.username, ssh.host
        )));
    }

    Ok(session)
}

/// A live tunnel.
struct ActiveTunnel {
    local_port: u16,
    remote_host: String,
    remote_port: u16,
    cancel: CancellationToken,
    session: Arc<Session>,
    accept_task: JoinHandle<()>,
}

impl ActiveTunnel {
    /// Stop accepting, end every forwarded socket and close the session.
    async fn close(self, id: Uuid) {
        self.cancel.cancel();
        let _ = self.accept_task.await;
        if let Err(e) = self.session.disconnect(Disconnect::ByApplication, "", "en").await {
            tracing::debug!(connection_id = %id, error = %e, "SSH session already closed");
        }
        tracing::info!(
            connection_id = %id,
            local_port = self.local_port,
            remote = %format!("{}:{}", self.remote_host, self.remote_port),
            "SSH tunnel closed"
        );
    }
}

/// Owner of all tunnels, at most one per connection id.
#[derive(Default)]
pub struct TunnelManager {
    tunnels: Mutex<HashMap<Uuid, ActiveTunnel>>,
}

impl TunnelManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a tunnel for `id` and return its local port.
    ///
    /// An existing tunnel for `id` is closed first. Credentials are resolved
    /// before any network I/O, and the local port is bound only after the SSH
    /// session authenticates.
    pub async fn create_tunnel(&self, id: Uuid, request: &TunnelRequest<'_>) -> Result<u16> {
        let previous = self.tunnels.lock().remove(&id);
        if let Some(previous) = previous {
            tracing::debug!(connection_id = %id, "Replacing existing SSH tunnel");
            previous.close(id).await;
        }

        let ssh = request.ssh;
        let auth = resolve_auth(ssh, request.secret).await?;

        tracing::info!(
            connection_id = %id,
            ssh_host = %ssh.host,
            ssh_port = ssh.port,
            ssh_user = %ssh.username,
            "Establishing SSH tunnel"
        );

        let session = tokio::time::timeout(SESSION_TIMEOUT, open_session(ssh, auth))
            .await
            .map_err(|_| {
                QueryPadError::tunnel(format!(
                    "Timed out connecting to SSH server {}:{}",
                    ssh.host, ssh.port
                ))
            })??;
        let session = Arc::new(session);

        let listener = match TcpListener::bind(("127.0.0.1", 0)).await {
            Ok(listener) => listener,
            Err(e) => {
                let _ = session.disconnect(Disconnect::ByApplication, "", "en").await;
                return Err(QueryPadError::tunnel_with_source("Failed to bind local tunnel port", e));
            }
        };
        let local_port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                let _ = session.disconnect(Disconnect::ByApplication, "", "en").await;
                return Err(QueryPadError::tunnel_with_source("Failed to read local tunnel port", e));
            }
        };

        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(run_listener(
            id,
            listener,
            session.clone(),
            request.remote_host.to_string(),
            request.remote_port,
            cancel.clone(),
        ));

        let tunnel = ActiveTunnel {
            local_port,
            remote_host: request.remote_host.to_string(),
            remote_port: request.remote_port,
            cancel,
            session,
            accept_task,
        };

        let displaced = self.tunnels.lock().insert(id, tunnel);
        if let Some(displaced) = displaced {
            displaced.close(id).await;
        }

        tracing::info!(connection_id = %id, local_port, "SSH tunnel listening");
        Ok(local_port)
    }

    /// Close the tunnel for `id`. No-op when absent.
    pub async fn close_tunnel(&self, id: Uuid) {
        let tunnel = self.tunnels.lock().remove(&id);
        if let Some(tunnel) = tunnel {
            tunnel.close(id).await;
        }
    }

    /// Close every tunnel concurrently and wait for all of them.
    pub async fn close_all_tunnels(&self) {
        let tunnels: Vec<(Uuid, ActiveTunnel)> = self.tunnels.lock().drain().collect();
        if tunnels.is_empty() {
            return;
        }
        tracing::info!(count = tunnels.len(), "Closing all SSH tunnels");
        join_all(tunnels.into_iter().map(|(id, tunnel)| tunnel.close(id))).await;
    }

    /// Whether a tunnel exists for `id`.
    pub fn has_tunnel(&self, id: Uuid) -> bool {
        self.tunnels.lock().contains_key(&id)
    }

    /// Local port of the tunnel for `id`.
    pub fn local_port(&self, id: Uuid) -> Option<u16> {
        self.tunnels.lock().get(&id).map(|t| t.local_port)
    }

    /// Number of live tunnels.
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.lock().len()
    }
}

/// Accept local sockets until cancelled.
async fn run_listener(
    id: Uuid,
    listener: TcpListener,
    session: Arc<Session>,
    remote_host: String,
    remote_port: u16,
    cancel: CancellationToken,
) {
    let mut failures = 0u32;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    failures = 0;
                    tracing::debug!(connection_id = %id, peer = %peer, "Tunnel connection accepted");
                    tokio::spawn(forward(
                        id,
                        socket,
                        session.clone(),
                        remote_host.clone(),
                        remote_port,
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = accept_backoff(failures);
                    tracing::warn!(
                        connection_id = %id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to accept tunnel connection"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            },
            _ = cancel.cancelled() => break,
        }
    }
}

/// Bridge one local socket over its own SSH channel.
///
/// Failures end only this socket.
async fn forward(
    id: Uuid,
    mut socket: TcpStream,
    session: Arc<Session>,
    remote_host: String,
    remote_port: u16,
    cancel: CancellationToken,
) {
    let channel = match session
        .channel_open_direct_tcpip(remote_host.as_str(), remote_port as u32, "127.0.0.1", 0)
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!(
                connection_id = %id,
                remote = %format!("{remote_host}:{remote_port}"),
                error = %e,
                "Failed to open SSH channel"
            );
            return;
        }
    };

    let mut stream = channel.into_stream();
    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut socket, &mut stream) => {
            if let Err(e) = result {
                tracing::debug!(connection_id = %id, error = %e, "Tunnel connection ended");
            }
        }
        _ = cancel.cancelled() => {}
    }
}
