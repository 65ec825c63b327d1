use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use sshsock_traits::tunnel::TunnelError;

use crate::listener::{ReconnectingListener, RemoteConnector};
use crate::pipe::pipe;
use crate::shutdown::Shutdown;

/// How the accept loop ended.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorReport {
    pub accepted: u64,
    pub failed_connections: u64,
    /// The listener broke while we were still running.
    pub accept_failed: bool,
}

impl SupervisorReport {
    pub fn is_success(&self) -> bool {
        !self.accept_failed && self.failed_connections == 0
    }
}

pub struct TunnelSupervisor {
    listener: ReconnectingListener,
    shutdown: Shutdown,
    tracker: TaskTracker,
}

impl TunnelSupervisor {
    pub fn new(listener: ReconnectingListener, shutdown: Shutdown) -> Self {
        Self {
            listener,
            shutdown,
            tracker: TaskTracker::new(),
        }
    }

    /// Accepts and forwards connections until shutdown or a listener failure,
    /// then waits for every forwarding task to finish.
    pub async fn run(self) -> SupervisorReport {
        let failed = Arc::new(AtomicU64::new(0));
        let mut report = SupervisorReport::default();

        loop {
            match self.listener.accept().await {
                Ok((local, peer)) => {
                    report.accepted += 1;
                    let connector = self.listener.connector();
                    let shutdown = self.shutdown.clone();
                    let failed = failed.clone();
                    self.tracker.spawn(async move {
                        if !forward(local, peer, &connector, &shutdown).await {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                }
                Err(e) => {
                    if !self.shutdown.is_triggered() {
                        error!("Failed to accept tcp connection: {}", e);
                        report.accept_failed = true;
                        // Nothing else will ever stop the tunnel now.
                        self.shutdown.trigger();
                    }
                    break;
                }
            }
        }

        let connector = self.listener.close();
        self.tracker.close();
        if !self.tracker.is_empty() {
            info!("Waiting for {} forwarded connection(s) to finish...", self.tracker.len());
        }
        self.tracker.wait().await;
        connector.close().await;

        report.failed_connections = failed.load(Ordering::Relaxed);
        debug!(?report, "supervisor finished");
        report
    }
}

/// Forwards one local connection. Returns `false` if it failed in a way worth
/// counting. The local stream is closed on every path.
async fn forward(local: TcpStream, peer: SocketAddr, connector: &RemoteConnector, shutdown: &Shutdown) -> bool {
    debug!(%peer, "accepted connection");
    if let Err(e) = local.set_nodelay(true) {
        debug!(%peer, "set_nodelay: {}", e);
    }

    let remote = match connector.connect().await {
        Ok(remote) => remote,
        Err(TunnelError::ShuttingDown) => return true,
        Err(e) => {
            error!(%peer, "Failed to connect to remote unix domain socket: {}", e);
            return false;
        }
    };

    let report = pipe(local, remote, shutdown).await;
    debug!(%peer, sent = report.sent, received = report.received, "connection closed");
    report.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_success_rules() {
        assert!(SupervisorReport::default().is_success());
        assert!(SupervisorReport { accepted: 3, ..Default::default() }.is_success());
        assert!(!SupervisorReport { failed_connections: 1, ..Default::default() }.is_success());
        assert!(!SupervisorReport { accept_failed: true, ..Default::default() }.is_success());
    }
}
