//! The live `russh`-backed [`ExecTransport`]/[`Connector`] implementation:
//! TCP connect, `known_hosts` verification via [`crate::known_hosts`],
//! [`AuthManager`]-ordered authentication, and channel I/O for both one-shot
//! exec and Force10/Cisco-style persistent shells.
//!
//! `russh::client::Handle` exposes no accessor for the server's SSH
//! identification banner once the handshake completes, so
//! [`RusshConnector`] peeks it straight off the socket (via
//! [`tokio::net::TcpStream::peek`], which doesn't consume the bytes) before
//! handing the stream to [`russh::client::connect_stream`].

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use russh::client::{self, AuthResult, Config as ClientConfig};
use russh::keys::{Algorithm, PrivateKeyWithHashAlg, PublicKey, PublicKeyBase64};
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::auth::{AuthManager, Credential, ResolvedSecret};
use crate::cluster::{Connector, HostSpec};
use crate::config;
use crate::error::{AuthError, Error, SessionError};
use crate::known_hosts::{self, StrictHostKeyChecking, VerifyOutcome};
use crate::session::{ConnectionSecurityOptions, ExecTransport};

/// Verifies the live server key against `known_hosts` for one connection;
/// constructed fresh per [`RusshConnector::connect_and_auth`] call.
struct ClientHandler {
    host: String,
    port: u16,
    strict: StrictHostKeyChecking,
    global_known_hosts: PathBuf,
    user_known_hosts: PathBuf,
    hash_known_hosts: bool,
}

impl client::Handler for ClientHandler {
    type Error = SessionError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let hostname = known_hosts::encode_host_port(&self.host, self.port);
        let key_type = server_public_key.algorithm().to_string();
        let blob_b64 = server_public_key.public_key_base64();
        let blob = BASE64.decode(&blob_b64).unwrap_or_default();
        let fingerprint = known_hosts::fingerprint_of_blob(&blob);

        match known_hosts::verify_transport_key(
            &hostname,
            &self.global_known_hosts,
            &self.user_known_hosts,
            &key_type,
            &fingerprint,
            self.strict,
            |_| false,
        ) {
            Ok(VerifyOutcome::AlreadyTrusted) => Ok(true),
            Ok(VerifyOutcome::AcceptedNew) => {
                if let Err(e) = known_hosts::append_known_host(
                    &self.user_known_hosts,
                    &hostname,
                    &key_type,
                    &blob_b64,
                    self.hash_known_hosts,
                ) {
                    log::warn!("{hostname}: failed to persist accepted host key: {e}");
                }
                Ok(true)
            }
            Err(e) => {
                log::warn!("{hostname}: host key verification rejected the server key: {e}");
                Ok(false)
            }
        }
    }
}

/// Whether a [`RusshTransport`] drives a fresh exec channel per command or
/// one persistent shell for the lifetime of the connection.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    OneShot,
    Persistent,
}

/// Live [`ExecTransport`] over one authenticated `russh` connection.
pub struct RusshTransport {
    handle: client::Handle<ClientHandler>,
    mode: Mode,
    channel: Option<russh::Channel<client::Msg>>,
    authenticated: bool,
    stdout_buf: VecDeque<u8>,
    stderr_buf: VecDeque<u8>,
    exit_status: Option<i32>,
}

impl RusshTransport {
    async fn pump(&mut self, timeout: Duration) -> Result<(), SessionError> {
        let Some(channel) = self.channel.as_mut() else {
            return Ok(());
        };
        if let Ok(Some(msg)) = tokio::time::timeout(timeout, channel.wait()).await {
            match msg {
                ChannelMsg::Data { data } => self.stdout_buf.extend(data.iter().copied()),
                ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                    self.stderr_buf.extend(data.iter().copied())
                }
                ChannelMsg::ExitStatus { exit_status } => self.exit_status = Some(exit_status as i32),
                ChannelMsg::Eof | ChannelMsg::Close => self.channel = None,
                _ => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ExecTransport for RusshTransport {
    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn has_persistent_shell(&self) -> bool {
        self.mode == Mode::Persistent && self.channel.is_some()
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        match self.mode {
            Mode::Persistent => {
                if let Some(channel) = self.channel.as_ref() {
                    channel.data(bytes).await?;
                }
                Ok(())
            }
            Mode::OneShot => {
                let command = String::from_utf8_lossy(bytes).trim_end_matches('\n').to_string();
                let channel = self.handle.channel_open_session().await?;
                channel.exec(true, command).await?;
                self.channel = Some(channel);
                self.stdout_buf.clear();
                self.stderr_buf.clear();
                self.exit_status = None;
                Ok(())
            }
        }
    }

    async fn recv_stdout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, SessionError> {
        if self.stdout_buf.is_empty() {
            self.pump(timeout).await?;
        }
        Ok(if self.stdout_buf.is_empty() {
            None
        } else {
            Some(self.stdout_buf.drain(..).collect())
        })
    }

    async fn recv_stderr(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, SessionError> {
        if self.stderr_buf.is_empty() {
            self.pump(timeout).await?;
        }
        Ok(if self.stderr_buf.is_empty() {
            None
        } else {
            Some(self.stderr_buf.drain(..).collect())
        })
    }

    fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    async fn send_keepalive(&mut self) -> Result<bool, SessionError> {
        Ok(self.handle.channel_open_session().await.is_ok())
    }

    async fn close(&mut self) {
        match self.mode {
            Mode::OneShot => self.channel = None,
            Mode::Persistent => {
                if let Some(channel) = self.channel.as_ref() {
                    let _ = channel
                        .data(format!("{}\n", config::defaults::FORCE_TTY_SIGNOFF).as_bytes())
                        .await;
                }
                let _ = self
                    .handle
                    .disconnect(Disconnect::ByApplication, "", "English")
                    .await;
                self.channel = None;
            }
        }
    }

    async fn upload(&mut self, local: &std::path::Path, remote: &str) -> Result<(), SessionError> {
        let channel = self.handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SessionError::Internal(format!("sftp init failed: {e}")))?;
        let mut remote_file = sftp
            .open_with_flags(remote, OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::TRUNCATE)
            .await
            .map_err(|e| SessionError::Internal(format!("sftp open {remote} failed: {e}")))?;
        let mut buf = Vec::new();
        tokio::fs::File::open(local)
            .await
            .map_err(|e| SessionError::Internal(format!("open {} failed: {e}", local.display())))?
            .read_to_end(&mut buf)
            .await
            .map_err(|e| SessionError::Internal(format!("read {} failed: {e}", local.display())))?;
        remote_file
            .write_all(&buf)
            .await
            .map_err(|e| SessionError::Internal(format!("sftp write {remote} failed: {e}")))?;
        remote_file
            .flush()
            .await
            .map_err(|e| SessionError::Internal(format!("sftp flush {remote} failed: {e}")))?;
        Ok(())
    }

    async fn download(&mut self, remote: &str, local: &std::path::Path) -> Result<(), SessionError> {
        let channel = self.handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SessionError::Internal(format!("sftp init failed: {e}")))?;
        let mut remote_file = sftp
            .open_with_flags(remote, OpenFlags::READ)
            .await
            .map_err(|e| SessionError::Internal(format!("sftp open {remote} failed: {e}")))?;
        let mut buf = Vec::new();
        remote_file
            .read_to_end(&mut buf)
            .await
            .map_err(|e| SessionError::Internal(format!("sftp read {remote} failed: {e}")))?;
        tokio::fs::write(local, &buf)
            .await
            .map_err(|e| SessionError::Internal(format!("write {} failed: {e}", local.display())))?;
        Ok(())
    }
}

/// Production [`Connector`]: TCP connect, `known_hosts` verification, then
/// [`AuthManager`]-ordered authentication over a raw `russh::client`
/// handshake. Force10/Cisco-family banners (per
/// [`config::is_force_tty`]) get a persistent PTY shell primed with
/// [`config::defaults::FORCE_TTY_SIGNON`] instead of per-command exec
/// channels.
pub struct RusshConnector {
    security: ConnectionSecurityOptions,
    global_known_hosts: PathBuf,
    user_known_hosts: PathBuf,
    hash_known_hosts: bool,
    connect_timeout: Duration,
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RusshConnector {
    pub fn new() -> Self {
        let home = dirs::home_dir().unwrap_or_default();
        RusshConnector {
            security: ConnectionSecurityOptions::default(),
            global_known_hosts: PathBuf::from("/etc/ssh/ssh_known_hosts"),
            user_known_hosts: home.join(".ssh/known_hosts"),
            hash_known_hosts: config::defaults::HASH_KNOWN_HOSTS,
            connect_timeout: Duration::from_secs(config::defaults::SOCKET_TIMEOUT_SECS),
        }
    }

    pub fn with_security(mut self, security: ConnectionSecurityOptions) -> Self {
        self.security = security;
        self
    }

    pub fn with_known_hosts(mut self, global: PathBuf, user: PathBuf) -> Self {
        self.global_known_hosts = global;
        self.user_known_hosts = user;
        self
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect_and_auth(
        &self,
        spec: &HostSpec,
        auth: &AuthManager,
    ) -> Result<(Box<dyn ExecTransport>, String, String), Error> {
        let addr = (spec.host.as_str(), spec.port);
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SessionError::InitTimeout(format!("{}:{}", spec.host, spec.port)))?
            .map_err(|e| {
                SessionError::Internal(format!("tcp connect to {}:{} failed: {e}", spec.host, spec.port))
            })?;
        let ip = tcp
            .peer_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|_| spec.host.clone());
        let ssh_version = peek_identification_banner(&tcp, self.connect_timeout).await;
        log::info!("{}: connected to {ip}:{} ({ssh_version})", spec.label, spec.port);

        let client_config = Arc::new(ClientConfig {
            preferred: self.security.preferred(),
            keepalive_interval: Some(Duration::from_secs(config::defaults::KEEPALIVE_SECS)),
            keepalive_max: config::defaults::KEEPALIVE_FAILURE_THRESHOLD as usize,
            ..Default::default()
        });
        let handler = ClientHandler {
            host: spec.host.clone(),
            port: spec.port,
            strict: self.security.strict_host_key_checking,
            global_known_hosts: self.global_known_hosts.clone(),
            user_known_hosts: self.user_known_hosts.clone(),
            hash_known_hosts: self.hash_known_hosts,
        };
        let mut handle = client::connect_stream(client_config, tcp, handler).await?;

        let is_force10 = config::is_force_tty(&ssh_version);
        let auth_result = auth
            .authenticate(&spec.host, is_force10, async |credential, resolved| {
                authenticate_once(&mut handle, &credential, resolved).await
            })
            .await;
        let authenticated = match auth_result {
            Ok(()) => {
                log::info!("{}: authenticated", spec.label);
                true
            }
            Err(e) => {
                log::warn!("{}: authentication failed: {e}", spec.label);
                false
            }
        };

        let (mode, channel) = if authenticated && is_force10 {
            let channel = handle.channel_open_session().await.map_err(SessionError::Russh)?;
            channel
                .request_pty(true, "xterm", 80, 24, 0, 0, &[])
                .await
                .map_err(SessionError::Russh)?;
            channel.request_shell(true).await.map_err(SessionError::Russh)?;
            channel
                .data(format!("{}\n", config::defaults::FORCE_TTY_SIGNON).as_bytes())
                .await
                .map_err(SessionError::Russh)?;
            (Mode::Persistent, Some(channel))
        } else {
            (Mode::OneShot, None)
        };

        let transport = RusshTransport {
            handle,
            mode,
            channel,
            authenticated,
            stdout_buf: VecDeque::new(),
            stderr_buf: VecDeque::new(),
            exit_status: None,
        };
        Ok((Box::new(transport), ssh_version, ip))
    }
}

/// Peek the server's SSH identification line (e.g. `SSH-2.0-OpenSSH_9.6`)
/// directly off the socket, leaving the bytes in place so `russh` can still
/// read them during its own handshake.
async fn peek_identification_banner(tcp: &TcpStream, timeout: Duration) -> String {
    let mut buf = [0u8; 256];
    let deadline = tokio::time::Instant::now() + timeout.min(Duration::from_secs(5));
    loop {
        if let Ok(n) = tcp.peek(&mut buf).await
            && n > 0
        {
            if let Some(pos) = buf[..n].iter().position(|&b| b == b'\n') {
                return String::from_utf8_lossy(&buf[..pos]).trim_end().to_string();
            }
            if n == buf.len() {
                return String::from_utf8_lossy(&buf[..n]).trim_end().to_string();
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return String::new();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn authenticate_once(
    handle: &mut client::Handle<ClientHandler>,
    credential: &Credential,
    secret: ResolvedSecret,
) -> Result<(), AuthError> {
    let user = credential.username.clone().unwrap_or_else(default_username);
    match secret {
        ResolvedSecret::Password(password) => {
            let result = handle
                .authenticate_password(user, password)
                .await
                .map_err(SessionError::Russh)?;
            ensure_auth(result)
        }
        ResolvedSecret::KeyFile { path, passphrase } => {
            let key = russh::keys::load_secret_key(&path, passphrase.as_deref())
                .map_err(|e| AuthError::KeyDecodeFailed(path.clone(), e.to_string()))?;
            let hash = if matches!(key.algorithm(), Algorithm::Rsa { .. }) {
                handle.best_supported_rsa_hash().await.map_err(SessionError::Russh)?.flatten()
            } else {
                None
            };
            let with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), hash);
            let result = handle
                .authenticate_publickey(user, with_hash)
                .await
                .map_err(SessionError::Russh)?;
            ensure_auth(result)
        }
        ResolvedSecret::AgentKey { public_key_blob_b64 } => {
            authenticate_with_agent(handle, &user, &public_key_blob_b64).await
        }
    }
}

fn ensure_auth(result: AuthResult) -> Result<(), AuthError> {
    match result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure { .. } => Err(AuthError::BadAuthenticationType),
    }
}

/// Ask the running agent for the identity matching `public_key_blob_b64` and
/// authenticate with just that one, honoring the ordered-credential design
/// of [`AuthManager`] rather than trying every agent identity blindly.
async fn authenticate_with_agent(
    handle: &mut client::Handle<ClientHandler>,
    user: &str,
    public_key_blob_b64: &str,
) -> Result<(), AuthError> {
    let mut agent = russh::keys::agent::client::AgentClient::connect_env()
        .await
        .map_err(|e| AuthError::Agent(e.to_string()))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| AuthError::Agent(e.to_string()))?;
    for key in identities {
        if key.public_key_base64() != public_key_blob_b64 {
            continue;
        }
        let hash = if matches!(key.algorithm(), Algorithm::Rsa { .. }) {
            handle.best_supported_rsa_hash().await.map_err(SessionError::Russh)?.flatten()
        } else {
            None
        };
        let result = handle
            .authenticate_publickey_with(user.to_string(), key, hash, &mut agent)
            .await
            .map_err(|e| AuthError::Agent(e.to_string()))?;
        return ensure_auth(result);
    }
    Err(AuthError::Agent("no agent identity matches the requested public key".to_string()))
}

/// `SSH_USER`, then `USER`, then `USERNAME`, then `root` as a last resort.
fn default_username() -> String {
    std::env::var("SSH_USER")
        .or_else(|_| std::env::var("USER"))
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "root".to_string())
}
