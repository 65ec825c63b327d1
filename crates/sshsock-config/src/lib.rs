use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use directories::BaseDirs;
use merge::Merge;
use sshsock_traits::config::{
    BackoffConfig, Config, ConfigError, ConfigService, Credentials, DEFAULT_SSH_PORT,
    ExternalClient, KeyMaterial, SshClient, SshTarget, TunnelConfig,
};
use sshsock_traits::ssh::preset_template;

pub struct ConfigServiceImpl;

impl ConfigService for ConfigServiceImpl {
    fn load_from_paths() -> Result<Config, ConfigError> {
        let home_dir_path = BaseDirs::new().map(|dirs| {
            dirs.home_dir().join(".sshsock/config.json")
        });

        let current_dir_path = Path::new("./sshsock.json").to_path_buf();

        let paths_to_check = [
            home_dir_path,
            Some(current_dir_path)
        ];

        for path in paths_to_check.iter().flatten() {
            if path.exists() {
                return Self::load_from_file(path);
            }
        }

        // No file is not an error; the layer simply contributes nothing.
        Ok(Config::empty())
    }

    fn load_from_file(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound);
        }
        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    fn expand_tilde<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
        let path = path.as_ref();
        let Ok(rest) = path.strip_prefix("~") else {
            return Some(path.to_path_buf());
        };

        BaseDirs::new().map(|dirs| dirs.home_dir().join(rest))
    }

    fn resolve(config: &Config) -> Result<TunnelConfig, ConfigError> {
        let addr = non_empty(&config.ssh_addr).ok_or(ConfigError::MissingSshAddress)?;
        let (addr_user, host, port) = parse_ssh_addr(addr)?;
        let user = addr_user
            .or_else(|| non_empty(&config.ssh_user).map(str::to_string))
            .ok_or(ConfigError::MissingSshUser)?;

        let listen_ip = config.listen_ip.as_deref().unwrap_or("127.0.0.1");
        let ip: IpAddr = listen_ip
            .parse()
            .map_err(|_| ConfigError::InvalidListenIp(listen_ip.to_string()))?;
        let listen_addr = SocketAddr::new(ip, config.listen_port.unwrap_or(0));

        let defaults = BackoffConfig::default();
        let backoff = BackoffConfig::new(
            config.backoff_min_ms.map(Duration::from_millis).unwrap_or(defaults.min),
            config.backoff_max_ms.map(Duration::from_millis).unwrap_or(defaults.max),
            config.backoff_max_attempts.unwrap_or(defaults.max_attempts),
        )?;

        Ok(TunnelConfig {
            remote_socket_path: non_empty(&config.remote_socket_path)
                .unwrap_or("/var/run/docker.sock")
                .to_string(),
            ssh: SshTarget { user, host, port },
            client: resolve_client(config)?,
            listen_addr,
            backoff,
        })
    }
}

/// Merges layers in increasing order of precedence on top of the defaults.
pub fn layered<I: IntoIterator<Item = Config>>(layers: I) -> Config {
    let mut config = Config::default();
    for layer in layers {
        config.merge(layer);
    }
    config
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Splits `[user@]host[:port]`. Bare IPv6 hosts must be bracketed to carry a port.
pub fn parse_ssh_addr(addr: &str) -> Result<(Option<String>, String, u16), ConfigError> {
    let invalid = || ConfigError::InvalidSshAddress(addr.to_string());

    let (user, rest) = match addr.split_once('@') {
        Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
        Some(_) => return Err(invalid()),
        None => (None, addr),
    };

    let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, tail) = bracketed.split_once(']').ok_or_else(invalid)?;
        let port = match tail {
            "" => DEFAULT_SSH_PORT,
            _ => tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .ok_or_else(invalid)?,
        };
        (host, port)
    } else if rest.matches(':').count() > 1 {
        (rest, DEFAULT_SSH_PORT)
    } else if let Some((host, port)) = rest.split_once(':') {
        (host, port.parse().map_err(|_| invalid())?)
    } else {
        (rest, DEFAULT_SSH_PORT)
    };

    if host.is_empty() {
        return Err(invalid());
    }
    Ok((user, host.to_string(), port))
}

fn resolve_client(config: &Config) -> Result<SshClient, ConfigError> {
    let extra_args = config.ssh_client_args.clone().unwrap_or_default();
    let verbose = config.verbose.unwrap_or(false);

    if let Some(template) = non_empty(&config.ssh_client_template) {
        return Ok(SshClient::External(ExternalClient {
            template: template.to_string(),
            extra_args,
            verbose,
        }));
    }

    match non_empty(&config.ssh_client).unwrap_or("native") {
        "native" => Ok(SshClient::Native(resolve_credentials(config)?)),
        name => preset_template(name)
            .map(|template| {
                SshClient::External(ExternalClient {
                    template: template.to_string(),
                    extra_args,
                    verbose,
                })
            })
            .ok_or_else(|| ConfigError::UnknownSshClient(name.to_string())),
    }
}

fn resolve_credentials(config: &Config) -> Result<Credentials, ConfigError> {
    let key = match non_empty(&config.ssh_key_path) {
        Some(raw) => {
            let path = ConfigServiceImpl::expand_tilde(raw).unwrap_or_else(|| PathBuf::from(raw));
            let bytes = fs::read(&path).map_err(|source| ConfigError::KeyFile {
                path: path.to_string_lossy().into_owned(),
                source,
            })?;
            Some(KeyMaterial {
                path,
                bytes,
                passphrase: non_empty(&config.ssh_key_passphrase).map(str::to_string),
            })
        }
        None => None,
    };

    let credentials = Credentials {
        key,
        agent_socket: non_empty(&config.ssh_auth_sock).map(PathBuf::from),
    };
    if credentials.is_empty() {
        return Err(ConfigError::NoCredentials);
    }
    Ok(credentials)
}
