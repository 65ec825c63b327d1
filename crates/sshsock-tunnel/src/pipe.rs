use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::shutdown::Shutdown;

/// What happened to one forwarded connection.
#[derive(Debug, Default)]
pub struct PipeReport {
    /// Bytes copied local -> remote.
    pub sent: u64,
    /// Bytes copied remote -> local.
    pub received: u64,
    /// The one error worth reporting, if any.
    pub error: Option<io::Error>,
}

impl PipeReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Couples `local` and `remote` until both directions are done.
///
/// A direction that reaches EOF half-closes its destination and lets the other
/// direction keep flowing. A direction that fails tears down the other one.
/// Only the first failure is reported, and none at all once `shutdown` has
/// been triggered. Both streams are dropped (closed) before this returns.
pub async fn pipe<L, R>(local: L, remote: R, shutdown: &Shutdown) -> PipeReport
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let abort = shutdown.child_token();
    let closing = AtomicBool::new(false);

    let outbound = async {
        let half = copy_half(&mut local_read, &mut remote_write, &abort).await;
        settle("local->remote", half, &closing, &abort, shutdown)
    };
    let inbound = async {
        let half = copy_half(&mut remote_read, &mut local_write, &abort).await;
        settle("remote->local", half, &closing, &abort, shutdown)
    };

    let ((sent, out_err), (received, in_err)) = tokio::join!(outbound, inbound);
    PipeReport {
        sent,
        received,
        error: out_err.or(in_err),
    }
}

const COPY_BUF_SIZE: usize = 16 * 1024;

/// One direction of a pipe: bytes written to the destination, and how it ended.
struct HalfCopy {
    bytes: u64,
    result: io::Result<()>,
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, abort: &CancellationToken) -> HalfCopy
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bytes = 0;
    let result = tokio::select! {
        result = copy_counting(reader, writer, &mut bytes) => result,
        _ = abort.cancelled() => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "forwarding aborted")),
    };
    HalfCopy { bytes, result }
}

/// Copies until EOF, then shuts down `writer`. `bytes` stays accurate when
/// this fails or is dropped halfway.
async fn copy_counting<R, W>(reader: &mut R, writer: &mut W, bytes: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        *bytes += n as u64;
    }
    writer.shutdown().await
}

fn settle(
    direction: &str,
    half: HalfCopy,
    closing: &AtomicBool,
    abort: &CancellationToken,
    shutdown: &Shutdown,
) -> (u64, Option<io::Error>) {
    match half.result {
        Ok(()) => {
            closing.store(true, Ordering::SeqCst);
            (half.bytes, None)
        }
        Err(e) => {
            let already_closing = closing.swap(true, Ordering::SeqCst);
            abort.cancel();
            if already_closing || shutdown.is_triggered() {
                debug!(bytes = half.bytes, "copy {} stopped: {}", direction, e);
                (half.bytes, None)
            } else {
                warn!(bytes = half.bytes, "copy {}: {}", direction, e);
                (half.bytes, Some(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, ReadBuf};

    /// Fails every read; swallows every write.
    struct BrokenStream;

    impl AsyncRead for BrokenStream {
        fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer")))
        }
    }

    impl AsyncWrite for BrokenStream {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_bytes_arrive_in_order_both_ways() {
        let (mut client, local) = duplex(64);
        let (remote, mut server) = duplex(64);
        let shutdown = Shutdown::new();
        let task = tokio::spawn(async move { pipe(local, remote, &shutdown).await });

        let request: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let response = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();

        let expected = request.clone();
        let server_side = tokio::spawn(async move {
            let mut got = Vec::new();
            server.read_to_end(&mut got).await.unwrap();
            assert_eq!(got, expected);
            server.write_all(&response).await.unwrap();
            server.shutdown().await.unwrap();
        });

        client.write_all(&request).await.unwrap();
        client.shutdown().await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"HTTP/1.1 200 OK\r\n\r\n");

        server_side.await.unwrap();
        let report = task.await.unwrap();
        assert!(report.is_ok());
        assert_eq!(report.sent, 10_000);
        assert_eq!(report.received, 19);
    }

    #[tokio::test]
    async fn test_half_close_still_delivers_pending_reply() {
        let (mut client, local) = duplex(16);
        let (remote, mut server) = duplex(16);
        let shutdown = Shutdown::new();
        let task = tokio::spawn(async move { pipe(local, remote, &shutdown).await });

        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();

        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"ping");

        // The local side stopped writing, but can still read.
        server.write_all(b"pong").await.unwrap();
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");

        let report = task.await.unwrap();
        assert!(report.is_ok());
        assert_eq!((report.sent, report.received), (4, 4));
    }

    #[tokio::test]
    async fn test_one_side_failing_is_reported_once() {
        let (_client, local) = duplex(16);
        let report = pipe(local, BrokenStream, &Shutdown::new()).await;
        let err = report.error.expect("remote read failure should be reported");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    /// Yields `chunk` once, then fails every read; swallows every write.
    struct ResetAfter {
        chunk: Option<Vec<u8>>,
    }

    impl AsyncRead for ResetAfter {
        fn poll_read(mut self: Pin<&mut Self>, _: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            match self.chunk.take() {
                Some(chunk) => {
                    buf.put_slice(&chunk);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"))),
            }
        }
    }

    impl AsyncWrite for ResetAfter {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_failed_direction_keeps_its_byte_count() {
        let (mut client, local) = duplex(64);
        let remote = ResetAfter {
            chunk: Some(b"HTTP/1.1 200".to_vec()),
        };
        let report = pipe(local, remote, &Shutdown::new()).await;

        assert_eq!(report.received, 12);
        assert_eq!(report.sent, 0);
        assert_eq!(report.error.map(|e| e.kind()), Some(io::ErrorKind::ConnectionReset));

        let mut delivered = Vec::new();
        client.read_to_end(&mut delivered).await.unwrap();
        assert_eq!(delivered, b"HTTP/1.1 200");
    }

    #[tokio::test]
    async fn test_both_sides_failing_reports_a_single_error() {
        let report = pipe(BrokenStream, BrokenStream, &Shutdown::new()).await;
        assert!(report.error.is_some());
        assert_eq!(report.sent + report.received, 0);
    }

    fn failed(bytes: u64, kind: io::ErrorKind) -> HalfCopy {
        HalfCopy {
            bytes,
            result: Err(io::Error::new(kind, "copy failed")),
        }
    }

    #[test]
    fn test_only_the_first_failing_direction_reports() {
        let closing = AtomicBool::new(false);
        let abort = CancellationToken::new();
        let shutdown = Shutdown::new();

        let first = settle("remote->local", failed(7, io::ErrorKind::ConnectionReset), &closing, &abort, &shutdown);
        assert!(abort.is_cancelled());
        let second = settle("local->remote", failed(3, io::ErrorKind::ConnectionAborted), &closing, &abort, &shutdown);

        let reported: Vec<_> = [&first, &second].iter().filter_map(|(_, e)| e.as_ref()).collect();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].kind(), io::ErrorKind::ConnectionReset);
        assert_eq!((first.0, second.0), (7, 3));
    }

    #[test]
    fn test_failure_after_clean_close_is_quiet() {
        let closing = AtomicBool::new(false);
        let abort = CancellationToken::new();
        let shutdown = Shutdown::new();

        let clean = settle("local->remote", HalfCopy { bytes: 4, result: Ok(()) }, &closing, &abort, &shutdown);
        assert_eq!(clean.0, 4);
        assert!(clean.1.is_none());
        assert!(!abort.is_cancelled());

        let late = settle("remote->local", failed(0, io::ErrorKind::BrokenPipe), &closing, &abort, &shutdown);
        assert!(late.1.is_none());
        assert!(abort.is_cancelled());
    }

    #[tokio::test]
    async fn test_errors_after_shutdown_are_not_reported() {
        let (_client, local) = duplex(16);
        let (remote, _server) = duplex(16);
        let shutdown = Shutdown::new();
        let stopper = shutdown.clone();

        let task = tokio::spawn(async move { pipe(local, remote, &shutdown).await });
        tokio::task::yield_now().await;
        stopper.trigger();

        let report = task.await.unwrap();
        assert!(report.is_ok());
    }

    #[tokio::test]
    async fn test_already_broken_stream_after_shutdown_is_quiet() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let report = pipe(BrokenStream, BrokenStream, &shutdown).await;
        assert!(report.is_ok());
    }
}
