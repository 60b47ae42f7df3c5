use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use packetwire_frame::TransportOpts;
use packetwire_transport::{Endpoint, ListenOpts, SocketListener};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::Result;
use crate::session::TransportSession;

/// Accepted sessions buffered ahead of the consumer.
const ACCEPT_BACKLOG: usize = 16;

/// Server-side connection builder.
#[derive(Debug, Clone)]
pub struct ServerBuilder {
    listen: ListenOpts,
    transport: TransportOpts,
}

impl ServerBuilder {
    pub fn new(listen: ListenOpts, transport: TransportOpts) -> Self {
        Self { listen, transport }
    }

    pub fn listen_opts(&self) -> &ListenOpts {
        &self.listen
    }

    pub fn transport_opts(&self) -> &TransportOpts {
        &self.transport
    }

    /// Bind the endpoint and start accepting in the background.
    pub async fn bind(&self) -> Result<SessionListener> {
        self.transport.validate()?;

        let socket = SocketListener::bind(&self.listen).await?;
        let local = socket.local_endpoint().clone();
        info!(endpoint = %local, "listening");

        let close = CancellationToken::new();
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        tokio::spawn(accept_loop(socket, self.transport.clone(), tx, close.clone()));

        Ok(SessionListener {
            local,
            close: close.clone(),
            rx,
            _stop: close.drop_guard(),
        })
    }
}

/// A bound listener handing out one [`TransportSession`] per accepted socket.
///
/// Dropping it stops accepting and (for IPC endpoints) removes the socket file.
pub struct SessionListener {
    local: Endpoint,
    close: CancellationToken,
    rx: mpsc::Receiver<Result<TransportSession>>,
    _stop: DropGuard,
}

impl SessionListener {
    /// The bound endpoint, with the actual port for `tcp://host:0`.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    /// Next accepted session. `None` once closed or after an accept failure
    /// was reported.
    pub async fn accept(&mut self) -> Option<Result<TransportSession>> {
        std::future::poll_fn(|cx| self.poll_accept(cx)).await
    }

    /// Accepted sessions as a stream.
    pub fn incoming(&mut self) -> Incoming<'_> {
        Incoming { listener: self }
    }

    /// Stop accepting. Sessions already handed out stay open.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Token that closes this listener when cancelled.
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<TransportSession>>> {
        if self.close.is_cancelled() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

/// Stream returned by [`SessionListener::incoming`].
pub struct Incoming<'a> {
    listener: &'a mut SessionListener,
}

impl Stream for Incoming<'_> {
    type Item = Result<TransportSession>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().listener.poll_accept(cx)
    }
}

async fn accept_loop(
    socket: SocketListener,
    opts: TransportOpts,
    tx: mpsc::Sender<Result<TransportSession>>,
    close: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = close.cancelled() => break,
            accepted = socket.accept() => accepted,
        };

        let item = match accepted {
            Ok(stream) => {
                let peer = stream.peer_label();
                debug!(endpoint = %socket.local_endpoint(), %peer, "accepted connection");
                Connection::with_peer(stream, opts.clone(), peer).map(TransportSession::new)
            }
            Err(err) => {
                warn!(endpoint = %socket.local_endpoint(), error = %err, "accept failed");
                Err(err.into())
            }
        };
        let failed = item.is_err();

        tokio::select! {
            _ = close.cancelled() => break,
            sent = tx.send(item) => if sent.is_err() { break },
        }
        if failed {
            break;
        }
    }
    debug!(endpoint = %socket.local_endpoint(), "listener closed");
}
