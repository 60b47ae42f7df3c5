use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

use crate::endpoint::{ConnectOpts, Endpoint};
use crate::error::{Result, TransportError};

/// A connected duplex socket implementing `AsyncRead + AsyncWrite`.
///
/// This is the fundamental I/O type returned by connect and accept.
pub struct SocketStream {
    inner: SocketStreamInner,
}

enum SocketStreamInner {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl SocketStream {
    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        Self {
            inner: SocketStreamInner::Tcp(stream),
        }
    }

    #[cfg(unix)]
    pub(crate) fn from_unix(stream: UnixStream) -> Self {
        Self {
            inner: SocketStreamInner::Unix(stream),
        }
    }

    /// Human-readable peer label for logs.
    pub fn peer_label(&self) -> String {
        match &self.inner {
            SocketStreamInner::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| format!("tcp://{addr}"))
                .unwrap_or_else(|_| "tcp://<unknown>".to_string()),
            #[cfg(unix)]
            SocketStreamInner::Unix(stream) => match stream.peer_addr() {
                Ok(addr) => match addr.as_pathname() {
                    Some(path) => format!("ipc://{}", path.display()),
                    None => "ipc://<unnamed>".to_string(),
                },
                Err(_) => "ipc://<unknown>".to_string(),
            },
        }
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            SocketStreamInner::Tcp(_) => "tcp",
            #[cfg(unix)]
            SocketStreamInner::Unix(_) => "unix-domain-socket",
        }
    }
}

impl AsyncRead for SocketStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            SocketStreamInner::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            SocketStreamInner::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SocketStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            SocketStreamInner::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            SocketStreamInner::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            SocketStreamInner::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            SocketStreamInner::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            SocketStreamInner::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            SocketStreamInner::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for SocketStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketStream")
            .field("type", &self.transport_name())
            .finish()
    }
}

/// Open a socket to `opts.endpoint`.
///
/// A single attempt: no retries. `connect_timeout` bounds the attempt and
/// surfaces as a `Connect` error of kind `TimedOut`.
pub async fn connect(opts: &ConnectOpts) -> Result<SocketStream> {
    let attempt = connect_endpoint(opts);
    match opts.connect_timeout {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Connect {
                endpoint: opts.endpoint.clone(),
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            }),
        },
        None => attempt.await,
    }
}

async fn connect_endpoint(opts: &ConnectOpts) -> Result<SocketStream> {
    let connect_err = |source| TransportError::Connect {
        endpoint: opts.endpoint.clone(),
        source,
    };

    match &opts.endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str()).await.map_err(connect_err)?;
            if opts.nodelay {
                stream.set_nodelay(true).map_err(connect_err)?;
            }
            debug!(%addr, "connected to tcp socket");
            Ok(SocketStream::from_tcp(stream))
        }
        #[cfg(unix)]
        Endpoint::Ipc(path) => {
            let stream = UnixStream::connect(path).await.map_err(connect_err)?;
            debug!(?path, "connected to unix domain socket");
            Ok(SocketStream::from_unix(stream))
        }
        #[cfg(not(unix))]
        Endpoint::Ipc(_) => Err(connect_err(io::Error::new(
            io::ErrorKind::Unsupported,
            "ipc endpoints require Unix domain sockets",
        ))),
    }
}
