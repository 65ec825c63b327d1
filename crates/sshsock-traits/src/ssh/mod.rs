use std::process::ExitStatus;
use std::sync::Arc;
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Built-in external client command lines, selectable by name.
pub const OPENSSH_TEMPLATE: &str =
    r#"ssh -nNT -p {remote_port} -L "{local_port}:{remote_socket_path}" "{remote_host}""#;
pub const PUTTY_TEMPLATE: &str =
    r#"putty -ssh -P {remote_port} "{remote_host}" -L "{local_port}:{remote_socket_path}""#;

pub fn preset_template(name: &str) -> Option<&'static str> {
    match name {
        "openssh" | "ssh" => Some(OPENSSH_TEMPLATE),
        "putty" => Some(PUTTY_TEMPLATE),
        _ => None,
    }
}

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("unknown placeholder '{{{0}}}'")]
    UnknownPlaceholder(String),
    #[error("unterminated placeholder starting at byte {0}")]
    Unterminated(usize),
    #[error("unbalanced '}}' at byte {0}")]
    Unbalanced(usize),
    #[error("cannot split command into words: {0}")]
    Tokenize(String),
    #[error("command is empty")]
    Empty,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to dial SSH server {addr}: {source}")]
    Dial {
        addr: String,
        source: russh::Error,
    },
    #[error("SSH authentication failed for {user}: {reason}")]
    Auth { user: String, reason: String },
    #[error("Failed to use ssh-agent at '{socket}': {reason}")]
    Agent { socket: String, reason: String },
    #[error("Failed to forward remote socket '{path}' over ssh: {source}")]
    ChannelOpen {
        path: String,
        source: russh::Error,
    },
    #[error("SSH session is not connected")]
    SessionLost,
    #[error("Failed to start external ssh client '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("External ssh client exited before forwarding port {port} ({status})")]
    ExitedEarly { port: u16, status: ExitStatus },
    #[error("Invalid external client command: {0}")]
    Template(#[from] TemplateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Any bidirectional byte stream a transport can hand back.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

pub type BoxedStream = Box<dyn TunnelStream>;

/// One way of reaching the remote Unix-domain socket.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a fresh stream to the remote socket.
    async fn connect(&self) -> Result<BoxedStream, TransportError>;

    /// Whether the transport can still serve `connect` calls. A transport that
    /// reports `false` is discarded and rebuilt by its owner.
    fn is_alive(&self) -> bool {
        true
    }

    async fn close(&self);

    fn kind(&self) -> &'static str;
}

/// Builds transports; called again whenever the current one has died.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn establish(&self) -> Result<Arc<dyn Transport>, TransportError>;
}
