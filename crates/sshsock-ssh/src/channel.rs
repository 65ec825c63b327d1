use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use russh::client::{self, Handle, Msg};
use russh::ChannelStream;
use sshsock_traits::ssh::TransportError;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::streamlocal::{StreamLocalOpen, CHANNEL_TYPE};

/// Channel streams have no socket of their own; both ends report this.
const PLACEHOLDER_ADDR: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// A `direct-streamlocal@openssh.com` channel used as a plain byte stream.
///
/// Non-data channel messages (requests, window adjustments, exit status) are
/// consumed by the underlying [`ChannelStream`] and never reach the reader.
pub struct RemoteSocketChannel {
    inner: Pin<Box<ChannelStream<Msg>>>,
    socket_path: String,
}

impl RemoteSocketChannel {
    pub async fn open<H>(session: &Handle<H>, socket_path: &str) -> Result<Self, TransportError>
    where
        H: client::Handler,
    {
        let request = StreamLocalOpen::new(socket_path);
        debug!(
            channel_type = CHANNEL_TYPE,
            payload_len = request.encoded_len(),
            "opening channel to {}",
            socket_path
        );

        let channel = session
            .channel_open_direct_streamlocal(request.socket_path)
            .await
            .map_err(|source| TransportError::ChannelOpen {
                path: socket_path.to_string(),
                source,
            })?;

        Ok(Self {
            inner: Box::pin(channel.into_stream()),
            socket_path: socket_path.to_string(),
        })
    }

    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    pub fn local_addr(&self) -> SocketAddr {
        PLACEHOLDER_ADDR
    }

    pub fn peer_addr(&self) -> SocketAddr {
        PLACEHOLDER_ADDR
    }

    /// Channels cannot time out individual reads; wrap calls in
    /// `tokio::time::timeout` instead.
    pub fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Err(deadline_unsupported())
    }

    pub fn set_write_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Err(deadline_unsupported())
    }
}

fn deadline_unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "ssh: remote socket channel: deadline not supported",
    )
}

impl AsyncRead for RemoteSocketChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for RemoteSocketChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.inner.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_shutdown(cx)
    }
}
