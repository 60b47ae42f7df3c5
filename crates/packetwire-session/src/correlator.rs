use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_core::Stream;
use packetwire_frame::{Headers, Packet, PacketEvent, PacketId};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace};

use crate::connection::Subscription;
use crate::error::{Result, SessionError};
use crate::ids::StreamIdAllocator;
use crate::session::TransportSession;

/// Matches responses to requests by stream id over one multiplexed session.
///
/// A routing task reads every inbound event and hands it to the request
/// waiting on that id. Each request owns its id until it completes, times
/// out or is dropped; ids are then returned to the allocator. Dropping the
/// correlator stops routing but leaves the session open.
pub struct RequestCorrelator {
    session: TransportSession,
    shared: Arc<Shared>,
    _router: DropGuard,
}

struct Shared {
    ids: StreamIdAllocator,
    /// `None` once the session is gone.
    pending: Mutex<Option<HashMap<u16, PendingRequest>>>,
}

struct PendingRequest {
    created_at: Instant,
    /// Headers the peer sent for this request's response so far.
    headers: Headers,
    sink: Sink,
}

enum Sink {
    /// Completes on the first payload or end event.
    Single(oneshot::Sender<PacketEvent>),
    /// Receives every event up to and including the end event.
    Stream(mpsc::UnboundedSender<PacketEvent>),
}

impl RequestCorrelator {
    pub fn new(session: TransportSession) -> Result<Self> {
        Self::with_allocator(session, StreamIdAllocator::new())
    }

    /// Correlator drawing ids from `ids`.
    ///
    /// Fails with `NotMultiplexed` when the session does not put stream ids
    /// on the wire, since responses could never be matched.
    pub fn with_allocator(session: TransportSession, ids: StreamIdAllocator) -> Result<Self> {
        if !session.opts().multiplexed {
            return Err(SessionError::NotMultiplexed);
        }

        let shared = Arc::new(Shared {
            ids,
            pending: Mutex::new(Some(HashMap::new())),
        });
        let stop = CancellationToken::new();
        let events = session.receive(None);
        tokio::spawn(route(events, Arc::clone(&shared), stop.clone()));

        Ok(Self {
            session,
            shared,
            _router: stop.drop_guard(),
        })
    }

    /// Send `packet` and wait for its response, using the session's timeout.
    pub async fn request(&self, packet: Packet) -> Result<Packet> {
        self.request_with_timeout(packet, self.session.opts().timeout)
            .await
    }

    /// Send `packet` and wait up to `timeout` for its response.
    ///
    /// The packet's id is replaced with a freshly allocated stream id. The
    /// response is the first payload (or bare end) packet carrying that id;
    /// its headers are the ones the peer sent for it after the request was
    /// registered, or none.
    pub async fn request_with_timeout(
        &self,
        packet: Packet,
        timeout: Option<Duration>,
    ) -> Result<Packet> {
        let (tx, rx) = oneshot::channel();
        let guard = self.register(Sink::Single(tx))?;
        let id = guard.id;

        self.send_stamped(packet, id).await?;

        let response = async { rx.await.map_err(|_| SessionError::ConnectionClosed) };
        let event = match timeout {
            Some(limit) => match tokio::time::timeout(limit, response).await {
                Ok(event) => event?,
                Err(_) => {
                    debug!(peer = %self.session.peer(), id, ?limit, "request timed out");
                    return Err(SessionError::RequestTimeout(limit));
                }
            },
            None => response.await?,
        };
        drop(guard);
        Ok(event.into_packet())
    }

    /// Send `packet` and stream every event of its response, ending after
    /// the end-of-stream event.
    pub async fn request_stream(&self, packet: Packet) -> Result<ResponseStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let guard = self.register(Sink::Stream(tx))?;
        let id = guard.id;

        self.send_stamped(packet, id).await?;

        Ok(ResponseStream {
            rx,
            state: StreamState::Open,
            guard,
        })
    }

    /// Requests currently awaiting a response.
    pub fn pending(&self) -> usize {
        self.shared.lock().as_ref().map_or(0, HashMap::len)
    }

    pub fn session(&self) -> &TransportSession {
        &self.session
    }

    fn register(&self, sink: Sink) -> Result<PendingGuard> {
        let id = self.shared.ids.alloc()?;
        let guard = PendingGuard {
            shared: Arc::clone(&self.shared),
            id,
        };

        let mut pending = self.shared.lock();
        let Some(table) = pending.as_mut() else {
            return Err(SessionError::ConnectionClosed);
        };
        table.insert(
            id,
            PendingRequest {
                created_at: Instant::now(),
                headers: Headers::default(),
                sink,
            },
        );
        drop(pending);
        Ok(guard)
    }

    async fn send_stamped(&self, packet: Packet, id: u16) -> Result<()> {
        let packet = Packet {
            id: Some(PacketId::Stream(id)),
            ..packet
        };
        self.session.send(&packet).await?;
        trace!(peer = %self.session.peer(), id, "request sent");
        Ok(())
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Option<HashMap<u16, PendingRequest>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, event: PacketEvent) {
        let Some(id) = event.stream_id() else {
            trace!("ignoring event without stream id");
            return;
        };

        let mut pending = self.lock();
        let Some(table) = pending.as_mut() else {
            return;
        };
        let Some(request) = table.get_mut(&id) else {
            debug!(id, "no pending request for response");
            return;
        };

        // Headers left on the connection by an earlier user of this id
        // must not leak into the response.
        let event = if event.is_head() {
            request.headers = event.packet().headers.clone();
            event
        } else {
            with_headers(event, request.headers.clone())
        };

        let finished = match &request.sink {
            Sink::Single(_) => !event.is_head(),
            Sink::Stream(_) => event.is_end(),
        };
        if !finished {
            if let Sink::Stream(tx) = &request.sink {
                let _ = tx.send(event);
            }
            return;
        }

        if let Some(request) = table.remove(&id) {
            drop(pending);
            trace!(id, elapsed = ?request.created_at.elapsed(), "response routed");
            match request.sink {
                Sink::Single(tx) => {
                    let _ = tx.send(event);
                }
                Sink::Stream(tx) => {
                    let _ = tx.send(event);
                }
            }
        }
    }

    fn fail_all(&self) {
        let taken = self.lock().take();
        if let Some(table) = &taken {
            if !table.is_empty() {
                debug!(pending = table.len(), "rejecting pending requests, connection closed");
            }
        }
        drop(taken);
    }
}

fn with_headers(event: PacketEvent, headers: Headers) -> PacketEvent {
    match event {
        PacketEvent::Head(packet) => PacketEvent::Head(Packet { headers, ..packet }),
        PacketEvent::Body(packet) => PacketEvent::Body(Packet { headers, ..packet }),
        PacketEvent::End(packet) => PacketEvent::End(Packet { headers, ..packet }),
    }
}

async fn route(mut events: Subscription, shared: Arc<Shared>, stop: CancellationToken) {
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break,
            next = events.recv() => next,
        };
        match next {
            Some(Ok(event)) => shared.dispatch(event),
            Some(Err(_)) | None => break,
        }
    }
    shared.fail_all();
}

/// Releases a request's id and pending entry however the request ends.
struct PendingGuard {
    shared: Arc<Shared>,
    id: u16,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let removed = self
            .shared
            .lock()
            .as_mut()
            .and_then(|table| table.remove(&self.id));
        drop(removed);
        self.shared.ids.release(self.id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    Done,
}

/// Events of one streamed response.
///
/// Ends after the end-of-stream event; yields `Err(ConnectionClosed)` first
/// if the connection goes away before that.
pub struct ResponseStream {
    rx: mpsc::UnboundedReceiver<PacketEvent>,
    state: StreamState,
    guard: PendingGuard,
}

impl ResponseStream {
    pub async fn recv(&mut self) -> Option<Result<PacketEvent>> {
        std::future::poll_fn(|cx| self.poll_event(cx)).await
    }

    /// The stream id carrying this response.
    pub fn id(&self) -> u16 {
        self.guard.id
    }

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<PacketEvent>>> {
        if self.state == StreamState::Done {
            return Poll::Ready(None);
        }
        match std::task::ready!(self.rx.poll_recv(cx)) {
            Some(event) => {
                if event.is_end() {
                    self.state = StreamState::Done;
                }
                Poll::Ready(Some(Ok(event)))
            }
            None => {
                self.state = StreamState::Done;
                Poll::Ready(Some(Err(SessionError::ConnectionClosed)))
            }
        }
    }
}

impl Stream for ResponseStream {
    type Item = Result<PacketEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_event(cx)
    }
}
