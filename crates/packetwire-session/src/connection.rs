use std::collections::HashMap;
use std::future::{poll_fn, Future};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use futures_core::Stream;
use packetwire_frame::{FrameParser, PacketAssembler, PacketEvent, PacketId, TransportOpts};
use packetwire_transport::TransportError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::error::{Result, SessionError};

const READ_CHUNK_SIZE: usize = 16 * 1024;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A framed duplex connection.
///
/// One reader task per connection owns the frame parser and fans decoded
/// packet events out to [`Subscription`]s. Writes are serialized through an
/// async mutex. Handles are cheap to clone; the connection is torn down on
/// [`destroy`](Self::destroy), on socket EOF or error, or when the last
/// handle is dropped.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    _owner: Arc<DropGuard>,
}

struct Shared {
    opts: TransportOpts,
    peer: String,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    subscribers: Registry<Subscriber>,
    error_sinks: Registry<UnboundedSender<Arc<SessionError>>>,
    destroyed: AtomicBool,
    failed: AtomicBool,
    close: CancellationToken,
}

struct Subscriber {
    filter: Option<PacketId>,
    tx: UnboundedSender<PacketEvent>,
}

impl Connection {
    /// Wrap `stream` and start its reader task. Must run inside a tokio runtime.
    pub fn new<S>(stream: S, opts: TransportOpts) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_peer(stream, opts, "stream")
    }

    /// Like [`new`](Self::new), with a peer label used in logs.
    pub fn with_peer<S>(stream: S, opts: TransportOpts, peer: impl Into<String>) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let parser = FrameParser::new(opts.clone())?;
        let (reader, writer) = tokio::io::split(stream);
        let close = CancellationToken::new();

        let shared = Arc::new(Shared {
            opts,
            peer: peer.into(),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            subscribers: Registry::new(),
            error_sinks: Registry::new(),
            destroyed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            close: close.clone(),
        });
        debug!(peer = %shared.peer, multiplexed = shared.opts.multiplexed, "connection opened");

        tokio::spawn(read_loop(Arc::clone(&shared), reader, parser));

        Ok(Self {
            shared,
            _owner: Arc::new(close.drop_guard()),
        })
    }

    /// Receive packet events whose id equals `filter`, or all events for `None`.
    ///
    /// Subscribing to a destroyed connection yields `ConnectionClosed` at once.
    pub fn subscribe(&self, filter: Option<PacketId>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.subscribers.insert(Subscriber { filter, tx });
        Subscription {
            rx,
            closed: false,
            _registration: Registration {
                shared: Arc::downgrade(&self.shared),
                id,
                remove: |shared, id| shared.subscribers.remove(id),
            },
        }
    }

    /// Side channel for errors that do not destroy the connection
    /// (undecodable frames, idle timeouts), plus the fatal error if the
    /// connection dies of one. Ends when the connection is destroyed.
    pub fn errors(&self) -> ErrorSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.error_sinks.insert(tx);
        ErrorSubscription {
            rx,
            _registration: Registration {
                shared: Arc::downgrade(&self.shared),
                id,
                remove: |shared, id| shared.error_sinks.remove(id),
            },
        }
    }

    /// Write already-encoded frames and flush.
    ///
    /// Concurrent writers are serialized, so frames from different calls
    /// never interleave. Fails with `ConnectionClosed` once destroyed, even
    /// if the write was blocked on a slow peer.
    pub async fn write_frames(&self, bytes: &[u8]) -> Result<()> {
        if self.is_destroyed() {
            return Err(SessionError::ConnectionClosed);
        }

        let outcome = tokio::select! {
            biased;
            _ = self.shared.close.cancelled() => return Err(SessionError::ConnectionClosed),
            outcome = self.shared.write_all(bytes) => outcome,
        };

        match outcome {
            Some(Ok(())) => Ok(()),
            None => Err(SessionError::ConnectionClosed),
            Some(Err(err)) => {
                let reason = io::Error::new(err.kind(), err.to_string());
                self.shared
                    .teardown(Some(TransportError::Io(reason).into()))
                    .await;
                Err(TransportError::Io(err).into())
            }
        }
    }

    /// Tear the connection down. Returns `false` if it already was.
    ///
    /// Every live subscription observes `ConnectionClosed` exactly once.
    pub async fn destroy(&self) -> bool {
        self.shared.teardown(None).await
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Acquire)
    }

    /// Resolves once the connection starts tearing down.
    pub async fn closed(&self) {
        self.shared.close.cancelled().await;
    }

    pub fn opts(&self) -> &TransportOpts {
        &self.shared.opts
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// Resolves on teardown with `true` if the connection died of an error.
    ///
    /// The returned future does not keep the connection alive.
    pub(crate) fn watch_close(&self) -> impl Future<Output = bool> + Send + 'static {
        let signal = self.shared.close.child_token();
        let shared = Arc::downgrade(&self.shared);
        async move {
            signal.cancelled().await;
            shared
                .upgrade()
                .is_some_and(|shared| shared.failed.load(Ordering::Acquire))
        }
    }

    /// Number of live packet subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.shared.peer)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

impl Shared {
    async fn write_all(&self, bytes: &[u8]) -> Option<io::Result<()>> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut()?;
        Some(
            async {
                writer.write_all(bytes).await?;
                writer.flush().await
            }
            .await,
        )
    }

    fn dispatch(&self, event: PacketEvent) {
        let id = event.packet().id.clone();
        self.subscribers.for_each(|sub| {
            if sub.filter.as_ref().is_none_or(|f| id.as_ref() == Some(f)) {
                // A dropped receiver unregisters itself; nothing to do here.
                let _ = sub.tx.send(event.clone());
            }
        });
    }

    fn report(&self, err: SessionError) {
        let err = Arc::new(err);
        self.error_sinks.for_each(|tx| {
            let _ = tx.send(Arc::clone(&err));
        });
    }

    async fn teardown(&self, reason: Option<SessionError>) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.failed.store(reason.is_some(), Ordering::Release);
        self.close.cancel();
        self.subscribers.close();

        match reason {
            Some(err) => {
                warn!(peer = %self.peer, error = %err, "connection destroyed");
                self.report(err);
            }
            None => debug!(peer = %self.peer, "connection closed"),
        }
        self.error_sinks.close();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(err) = writer.shutdown().await {
                debug!(peer = %self.peer, error = %err, "writer shutdown failed");
            }
        }
        true
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: R, mut parser: FrameParser)
where
    R: AsyncRead + Unpin,
{
    let mut assembler = PacketAssembler::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let idle = shared.opts.timeout;

    loop {
        let read = tokio::select! {
            _ = shared.close.cancelled() => break,
            read = read_chunk(&mut reader, &mut buf, idle) => read,
        };

        match read {
            Ok(Some(0)) => {
                if let Err(err) = parser.finish() {
                    warn!(peer = %shared.peer, error = %err, "peer closed connection mid-frame");
                } else {
                    debug!(peer = %shared.peer, "peer closed connection");
                }
                break;
            }
            Ok(Some(n)) => {
                for result in parser.push(&buf[..n]) {
                    match result {
                        Ok(frame) => shared.dispatch(assembler.accept(frame)),
                        Err(err) => {
                            warn!(peer = %shared.peer, error = %err, "dropping undecodable frame");
                            shared.report(err.into());
                        }
                    }
                }
            }
            Ok(None) => {
                let idle = idle.unwrap_or_default();
                debug!(peer = %shared.peer, ?idle, "connection idle");
                shared.report(SessionError::IdleTimeout(idle));
            }
            Err(err) => {
                shared.teardown(Some(TransportError::Io(err).into())).await;
                return;
            }
        }
    }
    shared.teardown(None).await;
}

/// Read one chunk. `Ok(None)` means the idle timeout elapsed first.
async fn read_chunk<R>(
    reader: &mut R,
    buf: &mut [u8],
    idle: Option<Duration>,
) -> io::Result<Option<usize>>
where
    R: AsyncRead + Unpin,
{
    match idle {
        Some(idle) => match tokio::time::timeout(idle, reader.read(buf)).await {
            Ok(read) => read.map(Some),
            Err(_) => Ok(None),
        },
        None => reader.read(buf).await.map(Some),
    }
}

/// Inbound packet events for one subscriber.
///
/// Yields `Err(ConnectionClosed)` once when the connection goes away, then
/// ends. Dropping it unregisters the subscriber.
pub struct Subscription {
    rx: UnboundedReceiver<PacketEvent>,
    closed: bool,
    _registration: Registration,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Result<PacketEvent>> {
        poll_fn(|cx| self.poll_event(cx)).await
    }

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<PacketEvent>>> {
        if self.closed {
            return Poll::Ready(None);
        }
        match ready!(self.rx.poll_recv(cx)) {
            Some(event) => Poll::Ready(Some(Ok(event))),
            None => {
                self.closed = true;
                Poll::Ready(Some(Err(SessionError::ConnectionClosed)))
            }
        }
    }
}

impl Stream for Subscription {
    type Item = Result<PacketEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_event(cx)
    }
}

/// Errors reported on a connection's side channel.
pub struct ErrorSubscription {
    rx: UnboundedReceiver<Arc<SessionError>>,
    _registration: Registration,
}

impl ErrorSubscription {
    pub async fn recv(&mut self) -> Option<Arc<SessionError>> {
        self.rx.recv().await
    }
}

impl Stream for ErrorSubscription {
    type Item = Arc<SessionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

struct Registration {
    shared: Weak<Shared>,
    id: Option<u64>,
    remove: fn(&Shared, u64),
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let (Some(id), Some(shared)) = (self.id, self.shared.upgrade()) {
            (self.remove)(&shared, id);
        }
    }
}

/// Id-keyed table that refuses new entries once closed.
struct Registry<T> {
    next_id: AtomicU64,
    slots: Mutex<Option<HashMap<u64, T>>>,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            slots: Mutex::new(Some(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<HashMap<u64, T>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `None` (and `item` dropped) when the registry is closed.
    fn insert(&self, item: T) -> Option<u64> {
        let mut slots = self.lock();
        let slots = slots.as_mut()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        slots.insert(id, item);
        Some(id)
    }

    fn remove(&self, id: u64) {
        let removed = self.lock().as_mut().and_then(|slots| slots.remove(&id));
        drop(removed);
    }

    fn for_each(&self, mut f: impl FnMut(&T)) {
        if let Some(slots) = self.lock().as_ref() {
            slots.values().for_each(&mut f);
        }
    }

    fn close(&self) {
        let taken = self.lock().take();
        drop(taken);
    }

    fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, HashMap::len)
    }
}
