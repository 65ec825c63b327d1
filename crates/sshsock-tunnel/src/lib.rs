//! The tunnel engine: accepts local TCP connections and forwards each one to
//! the remote Unix-domain socket over whichever transport was configured.

pub mod backoff;
pub mod listener;
pub mod pipe;
pub mod shutdown;
pub mod supervisor;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use sshsock_traits::config::{BackoffConfig, TunnelConfig};
use sshsock_traits::ssh::TransportFactory;
use sshsock_traits::tunnel::TunnelError;

pub use crate::listener::{ReconnectingListener, RemoteConnector};
pub use crate::pipe::{pipe, PipeReport};
pub use crate::shutdown::Shutdown;
pub use crate::supervisor::{SupervisorReport, TunnelSupervisor};

/// A started tunnel. Dropping it does not stop it; call [`RunningTunnel::stop`].
pub struct RunningTunnel {
    local_addr: SocketAddr,
    errors: mpsc::Receiver<TunnelError>,
    shutdown: Shutdown,
    supervisor: JoinHandle<SupervisorReport>,
}

impl RunningTunnel {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The address in the `tcp://host:port` form clients expect.
    pub fn advertised_url(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }

    /// Fatal errors only. Anything received here means the tunnel is done.
    pub fn errors(&mut self) -> &mut mpsc::Receiver<TunnelError> {
        &mut self.errors
    }

    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Stops accepting and tears down in-flight connections. Idempotent.
    pub fn stop(&self) {
        if self.shutdown.trigger() {
            info!("Shutting down tunnel on {}", self.local_addr);
        }
    }

    /// Waits for the supervisor to drain.
    pub async fn wait(self) -> Result<SupervisorReport, TunnelError> {
        self.supervisor.await.map_err(|e| TunnelError::Join(e.to_string()))
    }
}

/// Binds the configured listen address, brings up the configured transport
/// and starts forwarding.
pub async fn start(config: &TunnelConfig) -> Result<RunningTunnel, TunnelError> {
    let factory = sshsock_ssh::transport_factory(config)?;
    info!(
        "Forwarding {} to socket '{}' on {}",
        config.listen_addr, config.remote_socket_path, config.ssh
    );
    start_with_factory(config.listen_addr, config.backoff, factory).await
}

pub async fn start_with_factory(
    listen_addr: SocketAddr,
    backoff: BackoffConfig,
    factory: Arc<dyn TransportFactory>,
) -> Result<RunningTunnel, TunnelError> {
    let shutdown = Shutdown::new();
    let (listener, errors) = ReconnectingListener::bind(listen_addr, factory, backoff, shutdown.clone()).await?;
    listener.connector().warm_up().await?;

    let local_addr = listener.local_addr();
    info!("Listening on {}", local_addr);
    let supervisor = tokio::spawn(TunnelSupervisor::new(listener, shutdown.clone()).run());

    Ok(RunningTunnel {
        local_addr,
        errors,
        shutdown,
        supervisor,
    })
}
