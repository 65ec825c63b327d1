use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use merge::Merge;
use serde::Deserialize;
use thiserror::Error;

/// A custom merge strategy for `Option<T>` fields. It overwrites the destination
/// (`left`) with the source (`right`) only if the source is `Some`.
fn overwrite_if_some<T>(left: &mut Option<T>, right: Option<T>) {
    if right.is_some() {
        *left = right;
    }
}

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found at any of the expected locations")]
    NotFound,
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("No SSH server address specified")]
    MissingSshAddress,
    #[error("No SSH user name specified and none given in the server address")]
    MissingSshUser,
    #[error("Invalid SSH server address '{0}'")]
    InvalidSshAddress(String),
    #[error("Invalid listen IP '{0}'")]
    InvalidListenIp(String),
    #[error("Failed to read key file '{path}': {source}")]
    KeyFile {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to decode key file: {0}")]
    InvalidKey(String),
    #[error("No private key file or ssh-agent socket configured")]
    NoCredentials,
    #[error("Invalid backoff: minimum delay {min:?} exceeds maximum delay {max:?}")]
    InvalidBackoff { min: Duration, max: Duration },
    #[error("Unknown SSH client '{0}' (expected 'native', 'openssh' or 'putty')")]
    UnknownSshClient(String),
    #[error("Invalid external client command template: {0}")]
    Template(String),
}

/// The layered, partially-populated configuration as read from files and flags.
#[derive(Deserialize, Merge, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub ssh_addr: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub ssh_key_path: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub ssh_key_passphrase: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub ssh_auth_sock: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub remote_socket_path: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub listen_ip: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub listen_port: Option<u16>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub env_var_name: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub ssh_client: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub ssh_client_template: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub ssh_client_args: Option<Vec<String>>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub backoff_min_ms: Option<u64>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub backoff_max_ms: Option<u64>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub backoff_max_attempts: Option<u32>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub log_level: Option<String>,
    #[merge(strategy = overwrite_if_some)]
    #[serde(default)]
    pub verbose: Option<bool>,
}

impl Config {
    /// A layer with every field unset, used as the neutral element for merging.
    pub fn empty() -> Self {
        Self {
            ssh_addr: None, ssh_user: None, ssh_key_path: None,
            ssh_key_passphrase: None, ssh_auth_sock: None, remote_socket_path: None,
            listen_ip: None, listen_port: None, env_var_name: None,
            ssh_client: None, ssh_client_template: None, ssh_client_args: None,
            backoff_min_ms: None, backoff_max_ms: None, backoff_max_attempts: None,
            log_level: None, verbose: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ssh_addr: None,
            ssh_user: None,
            ssh_key_path: None,
            ssh_key_passphrase: None,
            ssh_auth_sock: None,
            remote_socket_path: Some("/var/run/docker.sock".to_string()),
            listen_ip: Some("127.0.0.1".to_string()),
            listen_port: Some(0),
            env_var_name: Some("DOCKER_HOST".to_string()),
            ssh_client: Some("native".to_string()),
            ssh_client_template: None,
            ssh_client_args: Some(Vec::new()),
            backoff_min_ms: Some(250),
            backoff_max_ms: Some(15_000),
            backoff_max_attempts: Some(10),
            log_level: Some("info".to_string()),
            verbose: Some(false),
        }
    }
}

/// Reconnect timing. `max_attempts == 0` means retry forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub min: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl BackoffConfig {
    pub fn new(min: Duration, max: Duration, max_attempts: u32) -> Result<Self, ConfigError> {
        if min > max {
            return Err(ConfigError::InvalidBackoff { min, max });
        }
        Ok(Self { min, max, max_attempts })
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_attempts == 0
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(250),
            max: Duration::from_secs(15),
            max_attempts: 10,
        }
    }
}

/// Where the SSH server lives and who we log in as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl SshTarget {
    /// `host:port` suitable for dialing, with IPv6 hosts bracketed.
    pub fn dial_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `user@host`, the form external SSH clients expect.
    pub fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl std::fmt::Display for SshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.dial_addr())
    }
}

/// Private key material read from disk, decoded later by the native transport.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("path", &self.path)
            .field("bytes", &format_args!("<{} bytes>", self.bytes.len()))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Signer sources offered during authentication, key first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub key: Option<KeyMaterial>,
    pub agent_socket: Option<PathBuf>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.key.is_none() && self.agent_socket.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalClient {
    /// Command line with `{local_port}`, `{remote_host}`, `{remote_port}` and
    /// `{remote_socket_path}` placeholders.
    pub template: String,
    pub extra_args: Vec<String>,
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshClient {
    Native(Credentials),
    External(ExternalClient),
}

/// The fully resolved, immutable description of one tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub remote_socket_path: String,
    pub ssh: SshTarget,
    pub client: SshClient,
    pub listen_addr: SocketAddr,
    pub backoff: BackoffConfig,
}

pub trait ConfigService {
    fn load_from_paths() -> Result<Config, ConfigError>;
    fn load_from_file(path: &Path) -> Result<Config, ConfigError>;
    fn expand_tilde<P: AsRef<Path>>(path: P) -> Option<PathBuf>;
    fn resolve(config: &Config) -> Result<TunnelConfig, ConfigError>;
}
