use thiserror::Error;

use crate::config::ConfigError;
use crate::ssh::TransportError;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("Failed to accept tcp connection: {0}")]
    Accept(std::io::Error),
    #[error("Listener closed")]
    ListenerClosed,
    #[error("Tunnel is shutting down")]
    ShuttingDown,
    #[error("Giving up after {attempts} failed attempts to reach the remote socket: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Supervisor task failed: {0}")]
    Join(String),
}

impl TunnelError {
    /// Errors that mean the tunnel cannot continue and the process should exit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::Config(_) | TunnelError::Bind { .. } | TunnelError::RetriesExhausted { .. }
        )
    }
}
