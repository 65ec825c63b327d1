//! SSH sessions established in-process with `russh`.
//!
//! One session is shared by every forwarded connection; each connection gets
//! its own `direct-streamlocal@openssh.com` channel on it. A session that dies
//! is never repaired here: the transport reports itself dead and its owner
//! builds a replacement through [`NativeFactory`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::{HashAlg, PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::Disconnect;
use tracing::{debug, info, warn};

use sshsock_traits::config::{ConfigError, Credentials, SshTarget, TunnelConfig};
use sshsock_traits::ssh::{BoxedStream, Transport, TransportError, TransportFactory};

use crate::channel::RemoteSocketChannel;

/// Accepts every host key.
///
/// There is no known_hosts or trust-on-first-use check. Anyone able to
/// intercept the TCP connection can impersonate the server.
pub struct PermissiveHostKeys;

impl client::Handler for PermissiveHostKeys {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        debug!(
            fingerprint = %server_public_key.fingerprint(HashAlg::Sha256),
            "accepting host key without verification"
        );
        Ok(true)
    }
}

pub type SessionHandle = Handle<PermissiveHostKeys>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

enum Session {
    Disconnected,
    Connecting,
    Connected(Arc<SessionHandle>),
    Failed,
}

/// Decoded signer sources, tried in order: private key, then agent.
#[derive(Clone, Default)]
pub struct Signers {
    pub key: Option<Arc<PrivateKey>>,
    pub agent_socket: Option<PathBuf>,
}

impl Signers {
    pub fn from_credentials(credentials: &Credentials) -> Result<Self, ConfigError> {
        let key = match &credentials.key {
            Some(material) => {
                let text = std::str::from_utf8(&material.bytes).map_err(|_| {
                    ConfigError::InvalidKey(format!("{} is not a text key file", material.path.display()))
                })?;
                let key = russh::keys::decode_secret_key(text, material.passphrase.as_deref())
                    .map_err(|e| ConfigError::InvalidKey(format!("{}: {}", material.path.display(), e)))?;
                Some(Arc::new(key))
            }
            None => None,
        };
        Ok(Self {
            key,
            agent_socket: credentials.agent_socket.clone(),
        })
    }
}

pub struct NativeTransport {
    target: SshTarget,
    socket_path: String,
    session: Mutex<Session>,
}

impl NativeTransport {
    pub fn new(target: SshTarget, socket_path: impl Into<String>) -> Self {
        Self {
            target,
            socket_path: socket_path.into(),
            session: Mutex::new(Session::Disconnected),
        }
    }

    pub fn state(&self) -> SessionState {
        match &*self.lock() {
            Session::Disconnected => SessionState::Disconnected,
            Session::Connecting => SessionState::Connecting,
            Session::Connected(handle) if handle.is_closed() => SessionState::Failed,
            Session::Connected(_) => SessionState::Connected,
            Session::Failed => SessionState::Failed,
        }
    }

    /// Dials and authenticates, moving Disconnected -> Connecting -> Connected,
    /// or to Failed on any error.
    pub async fn establish(&self, ssh_config: Arc<client::Config>, signers: &Signers) -> Result<(), TransportError> {
        *self.lock() = Session::Connecting;
        match open_session(&self.target, ssh_config, signers).await {
            Ok(handle) => {
                info!("connected to {}", self.target);
                *self.lock() = Session::Connected(Arc::new(handle));
                Ok(())
            }
            Err(e) => {
                *self.lock() = Session::Failed;
                Err(e)
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn live_handle(&self) -> Result<Arc<SessionHandle>, TransportError> {
        let mut session = self.lock();
        match &*session {
            Session::Connected(handle) if !handle.is_closed() => Ok(handle.clone()),
            Session::Connected(_) => {
                *session = Session::Failed;
                Err(TransportError::SessionLost)
            }
            _ => Err(TransportError::SessionLost),
        }
    }
}

#[async_trait]
impl Transport for NativeTransport {
    async fn connect(&self) -> Result<BoxedStream, TransportError> {
        let handle = self.live_handle()?;
        match RemoteSocketChannel::open(&*handle, &self.socket_path).await {
            Ok(channel) => Ok(Box::new(channel)),
            Err(e) => {
                if handle.is_closed() {
                    warn!("ssh session to {} was lost", self.target);
                    *self.lock() = Session::Failed;
                }
                Err(e)
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.state() == SessionState::Connected
    }

    async fn close(&self) {
        let previous = std::mem::replace(&mut *self.lock(), Session::Disconnected);
        if let Session::Connected(handle) = previous {
            if let Err(e) = handle.disconnect(Disconnect::ByApplication, "", "en").await {
                debug!("ssh disconnect from {}: {}", self.target, e);
            }
        }
    }

    fn kind(&self) -> &'static str {
        "native"
    }
}

async fn open_session(
    target: &SshTarget,
    ssh_config: Arc<client::Config>,
    signers: &Signers,
) -> Result<SessionHandle, TransportError> {
    let addr = target.dial_addr();
    debug!("dialing {}", addr);
    let mut handle = client::connect(ssh_config, (target.host.as_str(), target.port), PermissiveHostKeys)
        .await
        .map_err(|source| TransportError::Dial { addr, source })?;

    authenticate(&mut handle, &target.user, signers).await?;
    Ok(handle)
}

async fn authenticate(handle: &mut SessionHandle, user: &str, signers: &Signers) -> Result<(), TransportError> {
    let auth_error = |reason: String| TransportError::Auth {
        user: user.to_string(),
        reason,
    };

    let rsa_hash = handle
        .best_supported_rsa_hash()
        .await
        .map_err(|e| auth_error(e.to_string()))?
        .flatten();

    if let Some(key) = &signers.key {
        let result = handle
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key.clone(), rsa_hash))
            .await
            .map_err(|e| auth_error(e.to_string()))?;
        if result.success() {
            return Ok(());
        }
        debug!("private key rejected for {}", user);
    }

    if let Some(socket) = &signers.agent_socket {
        if authenticate_with_agent(handle, user, socket, rsa_hash).await? {
            return Ok(());
        }
    }

    Err(auth_error("no offered key was accepted".to_string()))
}

#[cfg(unix)]
async fn authenticate_with_agent(
    handle: &mut SessionHandle,
    user: &str,
    socket: &Path,
    rsa_hash: Option<HashAlg>,
) -> Result<bool, TransportError> {
    use russh::keys::agent::client::AgentClient;
    use russh::keys::agent::AgentIdentity;
    use russh::keys::Algorithm;
    use tokio::net::UnixStream;

    let agent_error = |reason: String| TransportError::Agent {
        socket: socket.display().to_string(),
        reason,
    };

    let stream = UnixStream::connect(socket).await.map_err(|e| agent_error(e.to_string()))?;
    let mut agent = AgentClient::connect(stream);
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| agent_error(e.to_string()))?;
    debug!(count = identities.len(), "offering ssh-agent identities");

    for identity in identities {
        let result = match identity {
            AgentIdentity::PublicKey { key, .. } => {
                let hash_alg = match key.algorithm() {
                    Algorithm::Rsa { .. } => rsa_hash,
                    _ => None,
                };
                handle
                    .authenticate_publickey_with(user.to_string(), key, hash_alg, &mut agent)
                    .await
            }
            AgentIdentity::Certificate { certificate, .. } => {
                let hash_alg = match certificate.algorithm() {
                    Algorithm::Rsa { .. } => rsa_hash,
                    _ => None,
                };
                handle
                    .authenticate_certificate_with(user.to_string(), certificate, hash_alg, &mut agent)
                    .await
            }
        };
        match result {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => continue,
            Err(err) => warn!(error = ?err, "ssh-agent signing attempt failed"),
        }
    }
    Ok(false)
}

#[cfg(not(unix))]
async fn authenticate_with_agent(
    _handle: &mut SessionHandle,
    _user: &str,
    socket: &Path,
    _rsa_hash: Option<HashAlg>,
) -> Result<bool, TransportError> {
    warn!("ssh-agent at {} is not supported on this platform", socket.display());
    Ok(false)
}

/// Builds a fresh, authenticated [`NativeTransport`] on every call.
pub struct NativeFactory {
    target: SshTarget,
    socket_path: String,
    signers: Signers,
    ssh_config: Arc<client::Config>,
}

impl NativeFactory {
    /// Decodes the private key up front so a bad key or passphrase is reported
    /// once at startup instead of on every reconnect.
    pub fn new(config: &TunnelConfig, credentials: &Credentials) -> Result<Self, ConfigError> {
        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            nodelay: true,
            ..Default::default()
        };
        Ok(Self {
            target: config.ssh.clone(),
            socket_path: config.remote_socket_path.clone(),
            signers: Signers::from_credentials(credentials)?,
            ssh_config: Arc::new(ssh_config),
        })
    }
}

#[async_trait]
impl TransportFactory for NativeFactory {
    async fn establish(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = NativeTransport::new(self.target.clone(), self.socket_path.clone());
        transport.establish(self.ssh_config.clone(), &self.signers).await?;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshsock_traits::config::KeyMaterial;

    fn target() -> SshTarget {
        SshTarget {
            user: "ops".to_string(),
            host: "127.0.0.1".to_string(),
            port: 22,
        }
    }

    #[tokio::test]
    async fn test_connect_before_establish_reports_session_lost() {
        let transport = NativeTransport::new(target(), "/var/run/docker.sock");
        assert_eq!(transport.state(), SessionState::Disconnected);
        assert!(!transport.is_alive());
        assert!(matches!(transport.connect().await.err(), Some(TransportError::SessionLost)));
        transport.close().await;
        assert_eq!(transport.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_dial_moves_to_failed() {
        // Port 1 on loopback is not an SSH server on any sane test machine.
        let transport = NativeTransport::new(
            SshTarget { port: 1, ..target() },
            "/var/run/docker.sock",
        );
        let err = transport
            .establish(Arc::new(client::Config::default()), &Signers::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Dial { .. }));
        assert_eq!(transport.state(), SessionState::Failed);
    }

    #[test]
    fn test_garbage_key_is_a_config_error() {
        let credentials = Credentials {
            key: Some(KeyMaterial {
                path: PathBuf::from("/tmp/id_test"),
                bytes: b"this is not a private key".to_vec(),
                passphrase: None,
            }),
            agent_socket: None,
        };
        assert!(matches!(
            Signers::from_credentials(&credentials),
            Err(ConfigError::InvalidKey(_))
        ));

        let binary = Credentials {
            key: Some(KeyMaterial {
                path: PathBuf::from("/tmp/id_test"),
                bytes: vec![0xff, 0xfe, 0x00],
                passphrase: None,
            }),
            agent_socket: None,
        };
        assert!(matches!(Signers::from_credentials(&binary), Err(ConfigError::InvalidKey(_))));
    }

    #[test]
    fn test_agent_only_credentials_decode() {
        let credentials = Credentials {
            key: None,
            agent_socket: Some(PathBuf::from("/tmp/agent.sock")),
        };
        let signers = Signers::from_credentials(&credentials).unwrap();
        assert!(signers.key.is_none());
        assert_eq!(signers.agent_socket, Some(PathBuf::from("/tmp/agent.sock")));
    }
}
