use std::fmt;

use packetwire_frame::TransportOpts;
use packetwire_transport::{ConnectOpts, Endpoint};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{Result, SessionError};
use crate::session::TransportSession;

/// Lifecycle of one connection attempt.
///
/// `Connecting → Connected → (Closed | Errored)`; an attempt may also go
/// straight from `Connecting` to a terminal state when it fails or is
/// cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Connecting,
    Connected,
    Closed,
    Errored,
}

impl AttemptState {
    pub fn can_transition_to(self, next: AttemptState) -> bool {
        use AttemptState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Closed)
                | (Connecting, Errored)
                | (Connected, Closed)
                | (Connected, Errored)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptState::Closed | AttemptState::Errored)
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptState::Connecting => "connecting",
            AttemptState::Connected => "connected",
            AttemptState::Closed => "closed",
            AttemptState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Tracks one attempt. Dropping it while still connecting counts as closing.
#[derive(Debug)]
pub(crate) struct Attempt {
    endpoint: String,
    state: AttemptState,
}

impl Attempt {
    pub(crate) fn new(endpoint: &Endpoint) -> Self {
        let endpoint = endpoint.to_string();
        debug!(%endpoint, state = %AttemptState::Connecting, "connect attempt started");
        Self {
            endpoint,
            state: AttemptState::Connecting,
        }
    }

    pub(crate) fn state(&self) -> AttemptState {
        self.state
    }

    /// Move to `next`. Invalid transitions are ignored and return `false`.
    pub(crate) fn advance(&mut self, next: AttemptState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                endpoint = %self.endpoint,
                from = %self.state,
                to = %next,
                "ignoring invalid connect attempt transition"
            );
            return false;
        }
        debug!(endpoint = %self.endpoint, from = %self.state, to = %next, "connect attempt");
        self.state = next;
        true
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        if self.state() == AttemptState::Connecting {
            self.advance(AttemptState::Closed);
        }
    }
}

/// Client-side connection builder.
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    connect: ConnectOpts,
    transport: TransportOpts,
}

impl ClientBuilder {
    pub fn new(connect: ConnectOpts, transport: TransportOpts) -> Self {
        Self { connect, transport }
    }

    pub fn connect_opts(&self) -> &ConnectOpts {
        &self.connect
    }

    pub fn transport_opts(&self) -> &TransportOpts {
        &self.transport
    }

    /// Dial the endpoint and wrap the socket in a session.
    ///
    /// Resolves exactly once: with the session, with the connect error, or
    /// with `Cancelled` when `cancel` fires first. Dropping the future
    /// abandons the attempt and closes any half-open socket.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<TransportSession> {
        self.transport.validate()?;

        let mut attempt = Attempt::new(&self.connect.endpoint);
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                attempt.advance(AttemptState::Closed);
                return Err(SessionError::Cancelled);
            }
            connected = packetwire_transport::connect(&self.connect) => connected,
        };

        let stream = match connected {
            Ok(stream) => stream,
            Err(err) => {
                debug!(endpoint = %self.connect.endpoint, error = %err, "connect failed");
                attempt.advance(AttemptState::Errored);
                return Err(err.into());
            }
        };

        let peer = stream.peer_label();
        let conn = match Connection::with_peer(stream, self.transport.clone(), peer) {
            Ok(conn) => conn,
            Err(err) => {
                attempt.advance(AttemptState::Errored);
                return Err(err);
            }
        };
        attempt.advance(AttemptState::Connected);

        let closed = conn.watch_close();
        tokio::spawn(async move {
            let failed = closed.await;
            attempt.advance(if failed {
                AttemptState::Errored
            } else {
                AttemptState::Closed
            });
        });

        Ok(TransportSession::new(conn))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use packetwire_frame::Packet;
    use packetwire_transport::{ListenOpts, SocketListener, TransportError};

    use super::*;

    #[test]
    fn attempt_transitions_are_checked() {
        use AttemptState::*;
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Errored));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Errored));
        assert!(!Errored.can_transition_to(Closed));
        assert!(Closed.is_terminal() && Errored.is_terminal());
        assert!(!Connected.is_terminal());
    }

    #[test]
    fn terminal_state_is_reached_once() {
        let mut attempt = Attempt::new(&Endpoint::tcp("127.0.0.1:1"));
        assert!(attempt.advance(AttemptState::Errored));
        assert!(!attempt.advance(AttemptState::Closed));
        assert_eq!(attempt.state(), AttemptState::Errored);
    }

    #[tokio::test]
    async fn connects_and_exchanges_packets() {
        let listener = SocketListener::bind(&ListenOpts::new(Endpoint::tcp("127.0.0.1:0")))
            .await
            .expect("listener should bind");
        let endpoint = listener.local_endpoint().clone();

        let server = tokio::spawn(async move {
            let stream = listener.accept().await.expect("accept");
            let session = TransportSession::from_stream(stream, TransportOpts::multiplexed())
                .expect("server session");
            let mut inbound = session.receive(None);
            let event = inbound.recv().await.expect("event").expect("open");
            session
                .send(&event.into_packet())
                .await
                .expect("echo back");
            session
        });

        let client = ClientBuilder::new(ConnectOpts::new(endpoint), TransportOpts::multiplexed())
            .connect(&CancellationToken::new())
            .await
            .expect("client should connect");
        let mut replies = client.receive(None);
        let packet = Packet::new().with_id(5u16).with_payload(&b"ping"[..]);
        client.send(&packet).await.expect("send");

        let reply = replies.recv().await.expect("event").expect("open");
        assert_eq!(reply.into_packet(), packet);
        assert!(client.peer().starts_with("tcp://127.0.0.1:"));
        let _server_session = server.await.expect("server task");
    }

    #[tokio::test]
    async fn cancelled_token_wins_over_connect() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let builder = ClientBuilder::new(
            ConnectOpts::new(Endpoint::tcp("127.0.0.1:9")),
            TransportOpts::default(),
        );
        assert!(matches!(
            builder.connect(&cancel).await,
            Err(SessionError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let listener = SocketListener::bind(&ListenOpts::new(Endpoint::tcp("127.0.0.1:0")))
            .await
            .expect("listener should bind");
        let endpoint = listener.local_endpoint().clone();
        drop(listener);

        let err = ClientBuilder::new(ConnectOpts::new(endpoint), TransportOpts::default())
            .connect(&CancellationToken::new())
            .await
            .expect_err("nothing listens there anymore");
        assert!(matches!(
            err,
            SessionError::Transport(TransportError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_transport_opts_fail_before_dialing() {
        let builder = ClientBuilder::new(
            ConnectOpts::new(Endpoint::tcp("127.0.0.1:9")),
            TransportOpts::default().with_delimiter(&b""[..]),
        );
        assert!(matches!(
            builder.connect(&CancellationToken::new()).await,
            Err(SessionError::Frame(_))
        ));
    }

    #[tokio::test]
    async fn dropping_connect_future_leaves_nothing_behind() {
        // Non-routable address: the dial hangs until dropped.
        let builder = ClientBuilder::new(
            ConnectOpts::new(Endpoint::tcp("10.255.255.1:9")),
            TransportOpts::default(),
        );
        let cancel = CancellationToken::new();
        let outcome = tokio::time::timeout(Duration::from_millis(50), builder.connect(&cancel)).await;
        // Either the dial was abandoned or the network rejected it outright.
        if let Ok(result) = outcome {
            assert!(result.is_err());
        }
    }
}
