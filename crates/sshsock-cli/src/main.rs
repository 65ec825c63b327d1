use std::path::PathBuf;
use std::process::{ExitCode, Stdio};

use anyhow::Context;
use clap::Parser;
use sshsock_config::{layered, ConfigServiceImpl};
use sshsock_logging::LoggingServiceImpl;
use sshsock_traits::config::{Config, ConfigService, SshClient, TunnelConfig};
use sshsock_traits::logging::LoggingService;
use sshsock_tunnel::{RunningTunnel, Shutdown};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Expose a remote Unix-domain socket as a local TCP port, tunneled over SSH.
///
/// With a trailing COMMAND, runs it with ENV_VAR_NAME=tcp://host:port in its
/// environment and exits when it does. Without one, prints that pair on
/// stdout and forwards until interrupted.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// SSH server address, `[user@]host[:port]`.
    #[arg(short = 'a', long = "ssh-server-addr")]
    pub ssh_server_addr: Option<String>,
    /// SSH user name; a `user@` in the server address takes precedence. Defaults to $USER.
    #[arg(short = 'u', long)]
    pub ssh_user: Option<String>,
    /// Private key file.
    #[arg(short = 'i', long = "ssh-key-file")]
    pub ssh_key_file: Option<String>,
    /// Passphrase for the private key file.
    #[arg(long = "ssh-key-pass", env = "SSHSOCK_KEY_PASSPHRASE", hide_env_values = true)]
    pub ssh_key_pass: Option<String>,
    /// ssh-agent socket. Defaults to $SSH_AUTH_SOCK.
    #[arg(long)]
    pub ssh_auth_sock: Option<String>,
    /// Path of the Unix-domain socket on the remote host.
    #[arg(short = 's', long)]
    pub remote_socket_path: Option<String>,
    #[arg(long)]
    pub listen_ip: Option<String>,
    /// Local port; 0 picks a free one.
    #[arg(short = 'p', long)]
    pub listen_port: Option<u16>,
    /// Name of the variable carrying the local address.
    #[arg(short = 'e', long)]
    pub env_var_name: Option<String>,
    /// `native`, `openssh` or `putty`.
    #[arg(long)]
    pub ssh_client: Option<String>,
    /// Custom external client command, e.g. `ssh -L "{local_port}:{remote_socket_path}" "{remote_host}"`.
    #[arg(long)]
    pub ssh_client_template: Option<String>,
    /// Extra argument appended to the external client command. Repeatable.
    #[arg(long = "ssh-client-arg", allow_hyphen_values = true)]
    pub ssh_client_args: Vec<String>,
    #[arg(long)]
    pub backoff_min_ms: Option<u64>,
    #[arg(long)]
    pub backoff_max_ms: Option<u64>,
    /// Consecutive failed attempts before giving up; 0 retries forever.
    #[arg(long)]
    pub backoff_max_attempts: Option<u32>,
    #[arg(short = 'v', long)]
    pub verbose: bool,
    #[arg(long)]
    pub log_level: Option<String>,
    /// Configuration file to use instead of ~/.sshsock/config.json or ./sshsock.json.
    #[arg(long)]
    pub config: Option<String>,
    #[arg(long)]
    pub no_color: bool,
    #[arg(long)]
    pub dry_run: bool,
    /// Command to run with the tunnel address in its environment.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl Cli {
    fn config_layer(&self) -> Config {
        Config {
            ssh_addr: self.ssh_server_addr.clone(),
            ssh_user: self.ssh_user.clone(),
            ssh_key_path: self.ssh_key_file.clone(),
            ssh_key_passphrase: self.ssh_key_pass.clone(),
            ssh_auth_sock: self.ssh_auth_sock.clone(),
            remote_socket_path: self.remote_socket_path.clone(),
            listen_ip: self.listen_ip.clone(),
            listen_port: self.listen_port,
            env_var_name: self.env_var_name.clone(),
            ssh_client: self.ssh_client.clone(),
            ssh_client_template: self.ssh_client_template.clone(),
            ssh_client_args: (!self.ssh_client_args.is_empty()).then(|| self.ssh_client_args.clone()),
            backoff_min_ms: self.backoff_min_ms,
            backoff_max_ms: self.backoff_max_ms,
            backoff_max_attempts: self.backoff_max_attempts,
            log_level: self.log_level.clone(),
            verbose: self.verbose.then_some(true),
        }
    }
}

/// Values picked up from the environment. Anything in a config file or on the
/// command line wins over these.
fn environment_layer() -> Config {
    Config {
        ssh_user: std::env::var("USER").ok(),
        ssh_auth_sock: std::env::var("SSH_AUTH_SOCK").ok(),
        ..Config::empty()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // --- Configuration Setup ---
    let file_config = match &cli.config {
        Some(raw) => {
            let path = ConfigServiceImpl::expand_tilde(raw).unwrap_or_else(|| PathBuf::from(raw));
            ConfigServiceImpl::load_from_file(&path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?
        }
        None => ConfigServiceImpl::load_from_paths()?,
    };
    let config = layered([environment_layer(), file_config, cli.config_layer()]);

    // --- Logging ---
    let verbose = config.verbose.unwrap_or(false);
    let level = match (&cli.log_level, verbose) {
        (None, true) => "debug",
        _ => config.log_level.as_deref().unwrap_or("info"),
    };
    LoggingServiceImpl::init_logging(level, !cli.no_color)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let tunnel_config = ConfigServiceImpl::resolve(&config).context("Invalid configuration")?;
    debug!("Final configuration: {:#?}", tunnel_config);
    let env_var_name = config.env_var_name.clone().unwrap_or_else(|| "DOCKER_HOST".to_string());

    if cli.dry_run {
        print_plan(&tunnel_config, &env_var_name, &cli.command);
        return Ok(ExitCode::SUCCESS);
    }

    // --- Main Application Logic ---
    let mut tunnel = sshsock_tunnel::start(&tunnel_config)
        .await
        .context("Failed to start tunnel")?;
    let signals = tokio::spawn(stop_on_signal(tunnel.shutdown()));

    let mut failed = match cli.command.split_first() {
        None => advertise(&mut tunnel, &env_var_name).await,
        Some((program, args)) => run_command(&mut tunnel, &env_var_name, program, args).await,
    };

    tunnel.stop();
    let report = tunnel.wait().await.context("Tunnel supervisor failed")?;
    signals.abort();
    info!(
        accepted = report.accepted,
        failed = report.failed_connections,
        "Tunnel closed."
    );
    failed |= !report.is_success();

    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

/// Prints the address and forwards until a signal or a fatal error.
/// Returns `true` if the tunnel failed.
async fn advertise(tunnel: &mut RunningTunnel, env_var_name: &str) -> bool {
    println!("{}={}", env_var_name, tunnel.advertised_url());
    let shutdown = tunnel.shutdown();
    tokio::select! {
        Some(err) = tunnel.errors().recv() => {
            error!("{}", err);
            true
        }
        _ = shutdown.triggered() => false,
    }
}

/// Runs the user's command against the tunnel. Returns `true` if the command
/// or the tunnel failed.
async fn run_command(tunnel: &mut RunningTunnel, env_var_name: &str, program: &str, args: &[String]) -> bool {
    info!("Running '{}' with {}={}", program, env_var_name, tunnel.advertised_url());
    let mut child = match Command::new(program)
        .args(args)
        .env(env_var_name, tunnel.advertised_url())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            error!("Failed to start '{}': {}", program, e);
            return true;
        }
    };

    let status = tokio::select! {
        status = child.wait() => status,
        Some(err) = tunnel.errors().recv() => {
            error!("{}", err);
            warn!("Stopping '{}' because the tunnel failed", program);
            if let Err(e) = child.kill().await {
                error!("Failed to stop '{}': {}", program, e);
            }
            return true;
        }
    };

    match status {
        Ok(status) if status.success() => false,
        Ok(status) => {
            error!("'{}' exited with {}", program, status);
            true
        }
        Err(e) => {
            error!("Failed to wait for '{}': {}", program, e);
            true
        }
    }
}

fn print_plan(config: &TunnelConfig, env_var_name: &str, command: &[String]) {
    info!("[dry-run] Would execute the following steps:");
    match &config.client {
        SshClient::Native(credentials) => {
            let mut sources = Vec::new();
            if let Some(key) = &credentials.key {
                sources.push(format!("key {}", key.path.display()));
            }
            if let Some(agent) = &credentials.agent_socket {
                sources.push(format!("agent {}", agent.display()));
            }
            info!("[dry-run] 1. Connect to {} using {}", config.ssh, sources.join(" and "));
        }
        SshClient::External(client) => {
            info!("[dry-run] 1. Start `{}` for each connection to reach {}", client.template, config.ssh);
        }
    }
    info!("[dry-run] 2. Listen on {}", config.listen_addr);
    info!("[dry-run] 3. Forward each connection to '{}'", config.remote_socket_path);
    info!(
        "[dry-run] 4. Retry failed connects from {:?} up to {:?}, {} attempts",
        config.backoff.min,
        config.backoff.max,
        if config.backoff.is_unbounded() { "unlimited".to_string() } else { config.backoff.max_attempts.to_string() }
    );
    match command.split_first() {
        Some((program, _)) => info!("[dry-run] 5. Run '{}' with {}=tcp://<listen address>", program, env_var_name),
        None => info!("[dry-run] 5. Print {}=tcp://<listen address> and wait for Ctrl+C", env_var_name),
    }
}

/// Triggers shutdown on the first termination signal.
async fn stop_on_signal(shutdown: Shutdown) {
    let name = tokio::select! {
        name = next_signal() => name,
        _ = shutdown.triggered() => return,
    };
    match name {
        Ok(name) => warn!("Received {} signal, shutting down...", name),
        Err(e) => {
            error!("Failed to listen for signals: {}", e);
            return;
        }
    }
    shutdown.trigger();
}

#[cfg(unix)]
async fn next_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    Ok(tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
    })
}

#[cfg(not(unix))]
async fn next_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl+C")
}
