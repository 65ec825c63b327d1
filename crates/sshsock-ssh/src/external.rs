use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use sshsock_traits::config::{ConfigError, ExternalClient, SshTarget, TunnelConfig};
use sshsock_traits::ssh::{BoxedStream, Transport, TransportError, TransportFactory};

use crate::template::{CommandTemplate, TemplateVars};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_PORT_PROBES: usize = 64;

/// Ports currently handed to a live external client, process-wide.
static RESERVED_PORTS: LazyLock<Mutex<HashSet<u16>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// An ephemeral loopback port no other connection in this process is using.
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
}

impl PortReservation {
    /// Asks the OS for a free port by binding a throwaway listener to port 0.
    pub async fn acquire() -> io::Result<Self> {
        for _ in 0..MAX_PORT_PROBES {
            let port = {
                let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
                listener.local_addr()?.port()
            };
            let mut reserved = RESERVED_PORTS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if reserved.insert(port) {
                return Ok(Self { port });
            }
            debug!(port, "ephemeral port still held by another connection, probing again");
        }
        Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "no unreserved ephemeral port available",
        ))
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        let mut reserved = RESERVED_PORTS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        reserved.remove(&self.port);
    }
}

/// A handle to a running external SSH client subprocess.
pub struct SshProcessHandle {
    child: Child,
    program: String,
}

impl Drop for SshProcessHandle {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        debug!("Terminating external ssh client '{}'...", self.program);
        if let Err(e) = self.child.start_kill() {
            error!("Failed to kill external ssh client process: {}", e);
        }
    }
}

/// The forwarded loopback connection plus everything that must outlive it.
///
/// Fields drop in order: the socket closes first, then the client process is
/// killed, then the port goes back to the pool.
struct ExternalStream {
    stream: TcpStream,
    _process: SshProcessHandle,
    _reservation: PortReservation,
}

impl AsyncRead for ExternalStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for ExternalStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Reaches the remote socket by running an external SSH client per connection
/// and talking to the local port it forwards.
pub struct ExternalTransport {
    template: CommandTemplate,
    extra_args: Vec<String>,
    verbose: bool,
    target: SshTarget,
    socket_path: String,
}

impl ExternalTransport {
    pub fn new(
        client: &ExternalClient,
        target: SshTarget,
        socket_path: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let transport = Self {
            template: CommandTemplate::parse(&client.template)?,
            extra_args: client.extra_args.clone(),
            verbose: client.verbose,
            target,
            socket_path: socket_path.into(),
        };
        // A template that cannot produce a command line is caught here, once.
        transport.command_line(0)?;
        Ok(transport)
    }

    fn command_line(&self, local_port: u16) -> Result<Vec<String>, TransportError> {
        let login = self.target.login();
        let vars = TemplateVars {
            local_port,
            remote_host: &login,
            remote_port: self.target.port,
            remote_socket_path: &self.socket_path,
        };
        Ok(self.template.argv(&vars, &self.extra_args)?)
    }

    fn spawn(&self, argv: &[String]) -> Result<SshProcessHandle, TransportError> {
        let (program, args) = argv
            .split_first()
            .ok_or(TransportError::Template(sshsock_traits::ssh::TemplateError::Empty))?;

        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        if self.verbose {
            info!("exec: {}", argv.join(" "));
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let child = cmd.spawn().map_err(|source| TransportError::Spawn {
            program: program.clone(),
            source,
        })?;
        Ok(SshProcessHandle {
            child,
            program: program.clone(),
        })
    }
}

/// Polls until the client accepts connections on `port`, or fails if it exits first.
async fn wait_for_forward(process: &mut SshProcessHandle, port: u16) -> Result<TcpStream, TransportError> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Some(status) = process.child.try_wait()? {
            return Err(TransportError::ExitedEarly { port, status });
        }
        if let Ok(stream) = TcpStream::connect(addr).await {
            return Ok(stream);
        }
    }
}

#[async_trait]
impl Transport for ExternalTransport {
    async fn connect(&self) -> Result<BoxedStream, TransportError> {
        let reservation = PortReservation::acquire().await?;
        let port = reservation.port();
        let argv = self.command_line(port)?;
        debug!(port, "starting external ssh client for {}", self.target);

        let mut process = self.spawn(&argv)?;
        let stream = wait_for_forward(&mut process, port).await?;
        debug!(port, "external ssh client is forwarding");

        Ok(Box::new(ExternalStream {
            stream,
            _process: process,
            _reservation: reservation,
        }))
    }

    async fn close(&self) {}

    fn kind(&self) -> &'static str {
        "external"
    }
}

/// Hands out the same stateless [`ExternalTransport`] on every call.
pub struct ExternalFactory {
    transport: Arc<ExternalTransport>,
}

impl ExternalFactory {
    pub fn new(config: &TunnelConfig, client: &ExternalClient) -> Result<Self, ConfigError> {
        let transport = ExternalTransport::new(client, config.ssh.clone(), config.remote_socket_path.clone())
            .map_err(|e| ConfigError::Template(e.to_string()))?;
        Ok(Self {
            transport: Arc::new(transport),
        })
    }
}

#[async_trait]
impl TransportFactory for ExternalFactory {
    async fn establish(&self) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(self.transport.clone())
    }
}
