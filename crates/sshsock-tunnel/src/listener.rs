use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use sshsock_traits::config::BackoffConfig;
use sshsock_traits::ssh::{BoxedStream, Transport, TransportError, TransportFactory};
use sshsock_traits::tunnel::TunnelError;

use crate::backoff::Backoff;
use crate::shutdown::Shutdown;

/// Hands out remote streams, rebuilding the transport underneath when it dies.
///
/// Shared by every forwarding task. The current transport is replaced as a
/// whole; a caller sees either the old one or the new one.
pub struct RemoteConnector {
    factory: Arc<dyn TransportFactory>,
    current: Mutex<Option<Arc<dyn Transport>>>,
    backoff: BackoffConfig,
    shutdown: Shutdown,
    fatal_tx: mpsc::Sender<TunnelError>,
    fatal_sent: AtomicBool,
}

impl RemoteConnector {
    fn new(
        factory: Arc<dyn TransportFactory>,
        backoff: BackoffConfig,
        shutdown: Shutdown,
    ) -> (Self, mpsc::Receiver<TunnelError>) {
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        let connector = Self {
            factory,
            current: Mutex::new(None),
            backoff,
            shutdown,
            fatal_tx,
            fatal_sent: AtomicBool::new(false),
        };
        (connector, fatal_rx)
    }

    /// Brings up the first transport, retrying with backoff.
    pub async fn warm_up(&self) -> Result<(), TunnelError> {
        self.retry("establish ssh transport", || async {
            self.current_transport().await.map(|_| ())
        })
        .await
    }

    /// Opens a stream to the remote socket, retrying with backoff.
    ///
    /// Every call starts a fresh backoff episode. Running out of retries is
    /// reported once on the fatal error channel and returned to the caller.
    pub async fn connect(&self) -> Result<BoxedStream, TunnelError> {
        self.retry("reach remote socket", || self.try_connect()).await
    }

    /// Runs `op` until it succeeds, the backoff runs out, or shutdown is
    /// triggered. Shutdown also abandons an attempt that is still running.
    async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, TunnelError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut backoff = Backoff::new(self.backoff);
        loop {
            let attempt = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => return Err(TunnelError::ShuttingDown),
                result = op() => result,
            };
            let last_error = match attempt {
                Ok(value) => {
                    if backoff.failures() > 0 {
                        info!(failures = backoff.failures(), "Managed to {} again", what);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let Some(delay) = backoff.next_delay() else {
                let attempts = backoff.failures();
                error!(attempts, "Failed to {}: {}; giving up", what, last_error);
                self.report_fatal(attempts, &last_error);
                return Err(TunnelError::RetriesExhausted {
                    attempts,
                    last_error: last_error.to_string(),
                });
            };
            warn!(
                attempt = backoff.failures(),
                delay_ms = delay.as_millis() as u64,
                "Failed to {}: {}; retrying",
                what,
                last_error
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.triggered() => return Err(TunnelError::ShuttingDown),
            }
        }
    }

    fn report_fatal(&self, attempts: u32, last_error: &TransportError) {
        if self.fatal_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let err = TunnelError::RetriesExhausted {
            attempts,
            last_error: last_error.to_string(),
        };
        if self.fatal_tx.try_send(err).is_err() {
            debug!("nobody is listening for fatal tunnel errors");
        }
    }

    /// Only one caller establishes at a time; the others wait on the slot.
    /// Callers race this against shutdown, which releases the slot.
    async fn current_transport(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let mut current = self.current.lock().await;
        if let Some(transport) = current.as_ref() {
            return Ok(transport.clone());
        }
        let transport = self.factory.establish().await?;
        debug!(kind = transport.kind(), "transport established");
        *current = Some(transport.clone());
        Ok(transport)
    }

    async fn try_connect(&self) -> Result<BoxedStream, TransportError> {
        let transport = self.current_transport().await?;
        match transport.connect().await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                if !transport.is_alive() {
                    self.discard(&transport).await;
                }
                Err(e)
            }
        }
    }

    /// Drops `dead` as the current transport unless someone already replaced it.
    async fn discard(&self, dead: &Arc<dyn Transport>) {
        let mut current = self.current.lock().await;
        let is_current = current.as_ref().is_some_and(|t| Arc::ptr_eq(t, dead));
        if is_current {
            *current = None;
            drop(current);
            warn!(kind = dead.kind(), "transport lost; it will be re-established");
            dead.close().await;
        }
    }

    pub async fn close(&self) {
        let transport = self.current.lock().await.take();
        if let Some(transport) = transport {
            transport.close().await;
        }
    }
}

/// A local TCP listener paired with the [`RemoteConnector`] that serves it.
pub struct ReconnectingListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    connector: Arc<RemoteConnector>,
    shutdown: Shutdown,
}

impl ReconnectingListener {
    pub async fn bind(
        addr: SocketAddr,
        factory: Arc<dyn TransportFactory>,
        backoff: BackoffConfig,
        shutdown: Shutdown,
    ) -> Result<(Self, mpsc::Receiver<TunnelError>), TunnelError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| TunnelError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| TunnelError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let (connector, errors) = RemoteConnector::new(factory, backoff, shutdown.clone());
        let listener = Self {
            listener,
            local_addr,
            connector: Arc::new(connector),
            shutdown,
        };
        Ok((listener, errors))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connector(&self) -> Arc<RemoteConnector> {
        self.connector.clone()
    }

    /// Waits for the next local connection. Returns [`TunnelError::ListenerClosed`]
    /// once shutdown has been triggered.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), TunnelError> {
        tokio::select! {
            biased;
            _ = self.shutdown.triggered() => Err(TunnelError::ListenerClosed),
            result = self.listener.accept() => result.map_err(TunnelError::Accept),
        }
    }

    /// Closes the listening socket. The connector stays usable so in-flight
    /// connections can finish.
    pub fn close(self) -> Arc<RemoteConnector> {
        debug!("closing listener on {}", self.local_addr);
        self.connector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Connect outcomes are scripted; once the script runs out, connects succeed.
    #[derive(Default)]
    struct ScriptedTransport {
        script: std::sync::Mutex<VecDeque<bool>>,
        connects: AtomicUsize,
        dies_on_failure: bool,
        alive: AtomicBool,
        closed: AtomicBool,
    }

    impl ScriptedTransport {
        fn new(script: &[bool], dies_on_failure: bool) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script.iter().copied().collect()),
                dies_on_failure,
                alive: AtomicBool::new(true),
                ..Default::default()
            })
        }

        fn push(&self, script: &[bool]) {
            self.script.lock().unwrap().extend(script.iter().copied());
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self) -> Result<BoxedStream, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let ok = self.script.lock().unwrap().pop_front().unwrap_or(true);
            if ok {
                let (stream, _peer) = tokio::io::duplex(64);
                Ok(Box::new(stream))
            } else {
                if self.dies_on_failure {
                    self.alive.store(false, Ordering::SeqCst);
                }
                Err(TransportError::SessionLost)
            }
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn kind(&self) -> &'static str {
            "scripted"
        }
    }

    /// Hands out the queued transports in order; fails when the queue is empty.
    struct QueueFactory {
        transports: std::sync::Mutex<VecDeque<Arc<ScriptedTransport>>>,
        establishes: AtomicUsize,
    }

    impl QueueFactory {
        fn new(transports: Vec<Arc<ScriptedTransport>>) -> Arc<Self> {
            Arc::new(Self {
                transports: std::sync::Mutex::new(transports.into()),
                establishes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TransportFactory for QueueFactory {
        async fn establish(&self) -> Result<Arc<dyn Transport>, TransportError> {
            self.establishes.fetch_add(1, Ordering::SeqCst);
            match self.transports.lock().unwrap().pop_front() {
                Some(t) => Ok(t),
                None => Err(TransportError::SessionLost),
            }
        }
    }

    fn backoff() -> BackoffConfig {
        BackoffConfig::new(Duration::from_millis(250), Duration::from_secs(15), 10).unwrap()
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_report_one_fatal_error() {
        let factory = QueueFactory::new(Vec::new());
        let (listener, mut errors) = ReconnectingListener::bind(loopback(), factory.clone(), backoff(), Shutdown::new())
            .await
            .unwrap();
        let connector = listener.connector();

        let started = Instant::now();
        let err = connector.connect().await.err().unwrap();
        let elapsed = started.elapsed();

        assert!(matches!(err, TunnelError::RetriesExhausted { attempts: 10, .. }));
        assert_eq!(factory.establishes.load(Ordering::SeqCst), 10);
        // 250 + 500 + 1000 + 2000 + 4000 + 8000 + 3 * 15000
        assert!(elapsed >= Duration::from_millis(60_750));
        assert!(elapsed < Duration::from_millis(61_000));

        assert!(matches!(errors.try_recv(), Ok(TunnelError::RetriesExhausted { .. })));

        // A second exhausted episode is returned to the caller but not re-reported.
        assert!(connector.connect().await.is_err());
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tenth_failure_is_terminal() {
        // The eleventh connect would succeed, but it must never be made.
        let transport = ScriptedTransport::new(&[false; 10], false);
        let factory = QueueFactory::new(vec![transport.clone()]);
        let (listener, mut errors) = ReconnectingListener::bind(loopback(), factory, backoff(), Shutdown::new())
            .await
            .unwrap();
        let connector = listener.connector();

        let err = connector.connect().await.err().unwrap();
        assert!(matches!(err, TunnelError::RetriesExhausted { attempts: 10, .. }));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 10);
        assert!(matches!(
            errors.try_recv(),
            Ok(TunnelError::RetriesExhausted { attempts: 10, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_success() {
        let transport = ScriptedTransport::new(&[false, false, false], false);
        let factory = QueueFactory::new(vec![transport.clone()]);
        let (listener, _errors) = ReconnectingListener::bind(loopback(), factory, backoff(), Shutdown::new())
            .await
            .unwrap();
        let connector = listener.connector();

        let started = Instant::now();
        connector.connect().await.unwrap();
        let first_episode = started.elapsed();
        assert!(first_episode >= Duration::from_millis(250 + 500 + 1_000));
        assert!(first_episode < Duration::from_millis(2_000));

        transport.push(&[false]);
        let started = Instant::now();
        connector.connect().await.unwrap();
        let second_episode = started.elapsed();
        assert!(second_episode >= Duration::from_millis(250));
        assert!(second_episode < Duration::from_millis(500));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_transport_is_replaced() {
        let first = ScriptedTransport::new(&[false], true);
        let second = ScriptedTransport::new(&[], false);
        let factory = QueueFactory::new(vec![first.clone(), second.clone()]);
        let (listener, _errors) = ReconnectingListener::bind(loopback(), factory.clone(), backoff(), Shutdown::new())
            .await
            .unwrap();
        let connector = listener.connector();

        connector.warm_up().await.unwrap();
        connector.connect().await.unwrap();

        assert_eq!(factory.establishes.load(Ordering::SeqCst), 2);
        assert!(first.closed.load(Ordering::SeqCst));
        assert_eq!(second.connects.load(Ordering::SeqCst), 1);

        connector.close().await;
        assert!(second.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let factory = QueueFactory::new(Vec::new());
        let shutdown = Shutdown::new();
        let (listener, _errors) = ReconnectingListener::bind(loopback(), factory, backoff(), shutdown.clone())
            .await
            .unwrap();
        let connector = listener.connector();

        let pending = tokio::spawn(async move { connector.connect().await });
        tokio::time::sleep(Duration::from_millis(600)).await;
        shutdown.trigger();
        assert!(matches!(pending.await.unwrap(), Err(TunnelError::ShuttingDown)));
    }

    /// Never finishes establishing.
    struct HangingFactory {
        establishes: AtomicUsize,
    }

    #[async_trait]
    impl TransportFactory for HangingFactory {
        async fn establish(&self) -> Result<Arc<dyn Transport>, TransportError> {
            self.establishes.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_shutdown_abandons_hanging_establish() {
        let factory = Arc::new(HangingFactory {
            establishes: AtomicUsize::new(0),
        });
        let shutdown = Shutdown::new();
        let (listener, mut errors) = ReconnectingListener::bind(loopback(), factory.clone(), backoff(), shutdown.clone())
            .await
            .unwrap();

        // The first caller holds the transport slot, the second queues behind it.
        let first = tokio::spawn({
            let connector = listener.connector();
            async move { connector.connect().await }
        });
        let second = tokio::spawn({
            let connector = listener.connector();
            async move { connector.connect().await }
        });
        while factory.establishes.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        shutdown.trigger();
        for pending in [first, second] {
            let result = tokio::time::timeout(Duration::from_secs(1), pending)
                .await
                .expect("connect should give up on shutdown")
                .unwrap();
            assert!(matches!(result, Err(TunnelError::ShuttingDown)));
        }
        assert_eq!(factory.establishes.load(Ordering::SeqCst), 1);
        assert!(errors.try_recv().is_err());

        // The slot was released, so closing does not block either.
        tokio::time::timeout(Duration::from_secs(1), listener.close().close())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_accept_after_shutdown_reports_closed() {
        let shutdown = Shutdown::new();
        let (listener, _errors) = ReconnectingListener::bind(
            loopback(),
            QueueFactory::new(Vec::new()),
            backoff(),
            shutdown.clone(),
        )
        .await
        .unwrap();
        assert_ne!(listener.local_addr().port(), 0);

        let addr = listener.local_addr();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (_, peer) = listener.accept().await.unwrap();
        assert!(peer.ip().is_loopback());

        shutdown.trigger();
        assert!(matches!(listener.accept().await, Err(TunnelError::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let taken = TcpListener::bind(loopback()).await.unwrap();
        let addr = taken.local_addr().unwrap();
        let err = ReconnectingListener::bind(addr, QueueFactory::new(Vec::new()), backoff(), Shutdown::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::Bind { .. }));
        assert!(err.is_fatal());
    }
}
