use bytes::{Bytes, BytesMut};
use packetwire_frame::{
    decode_packet, encode_chunk, encode_end, encode_packet, Packet, TransportOpts,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use crate::connection::{Connection, ErrorSubscription, Subscription};
use crate::error::Result;

/// Packet events selected by [`TransportSession::receive`].
pub type PacketStream = Subscription;

/// Side-channel errors from [`TransportSession::errors`].
pub type ErrorStream = ErrorSubscription;

/// Local write acknowledgement.
///
/// Returned once the frames were handed to the socket and flushed. It says
/// nothing about whether the peer has read them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Encoded size of everything written, delimiters included.
    pub bytes: usize,
}

/// Packet-level view of one connection.
///
/// Clones share the connection.
#[derive(Debug, Clone)]
pub struct TransportSession {
    conn: Connection,
}

impl From<Connection> for TransportSession {
    fn from(conn: Connection) -> Self {
        Self::new(conn)
    }
}

impl TransportSession {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Start a session over any duplex byte stream.
    pub fn from_stream<S>(stream: S, opts: TransportOpts) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Ok(Self::new(Connection::new(stream, opts)?))
    }

    /// Encode `packet` and write it.
    ///
    /// An oversized or unframeable packet fails before anything is written.
    pub async fn send(&self, packet: &Packet) -> Result<Ack> {
        let mut buf = BytesMut::new();
        encode_packet(packet, self.opts(), &mut buf)?;
        self.write(buf, packet.stream_id()).await
    }

    /// Write one chunk of a streaming body.
    pub async fn send_chunk(&self, stream_id: Option<u16>, body: &[u8]) -> Result<Ack> {
        let mut buf = BytesMut::with_capacity(body.len() + self.opts().delimiter.len() + 3);
        encode_chunk(stream_id, body, self.opts(), &mut buf)?;
        self.write(buf, stream_id).await
    }

    /// Close a streaming body with the end-of-stream marker.
    pub async fn end_stream(&self, stream_id: Option<u16>) -> Result<Ack> {
        let mut buf = BytesMut::new();
        encode_end(stream_id, self.opts(), &mut buf);
        self.write(buf, stream_id).await
    }

    async fn write(&self, buf: BytesMut, stream_id: Option<u16>) -> Result<Ack> {
        self.conn.write_frames(&buf).await?;
        trace!(peer = %self.conn.peer(), ?stream_id, bytes = buf.len(), "frames written");
        Ok(Ack { bytes: buf.len() })
    }

    /// Inbound packet events, narrowed to `matching`'s id when given.
    ///
    /// The stream yields `Err(ConnectionClosed)` once on teardown, then ends.
    pub fn receive(&self, matching: Option<&Packet>) -> PacketStream {
        self.conn
            .subscribe(matching.and_then(|packet| packet.id.clone()))
    }

    pub fn errors(&self) -> ErrorStream {
        self.conn.errors()
    }

    /// Wire image of `packet` without writing it anywhere.
    ///
    /// With `with_payload` false the packet is encoded header-only.
    pub fn serialize(&self, packet: &Packet, with_payload: bool) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        if with_payload {
            encode_packet(packet, self.opts(), &mut buf)?;
        } else {
            let head = Packet {
                payload: None,
                ..packet.clone()
            };
            encode_packet(&head, self.opts(), &mut buf)?;
        }
        Ok(buf.freeze())
    }

    /// Inverse of [`serialize`](Self::serialize).
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Packet> {
        Ok(decode_packet(bytes, self.opts())?)
    }

    /// Tear the session down. Returns `false` if it already was.
    pub async fn destroy(&self) -> bool {
        self.conn.destroy().await
    }

    pub async fn closed(&self) {
        self.conn.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_destroyed()
    }

    pub fn opts(&self) -> &TransportOpts {
        self.conn.opts()
    }

    pub fn peer(&self) -> &str {
        self.conn.peer()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use packetwire_frame::{FrameError, PacketEvent};
    use tokio::io::duplex;

    use super::*;
    use crate::error::SessionError;

    fn session_pair(opts: TransportOpts) -> (TransportSession, TransportSession) {
        let (a, b) = duplex(256 * 1024);
        (
            TransportSession::from_stream(a, opts.clone()).expect("session a"),
            TransportSession::from_stream(b, opts).expect("session b"),
        )
    }

    #[tokio::test]
    async fn send_reports_flushed_bytes_and_peer_receives() {
        let (client, server) = session_pair(TransportOpts::multiplexed());
        let mut inbound = server.receive(None);

        let packet = Packet::new()
            .with_id(4u16)
            .with_header("content-type", "text/plain")
            .with_payload(&b"hello"[..]);
        let ack = client.send(&packet).await.expect("send");
        assert_eq!(ack.bytes, client.serialize(&packet, true).expect("serialize").len());

        let head = inbound.recv().await.expect("event").expect("open");
        assert!(head.is_head());
        let body = inbound.recv().await.expect("event").expect("open");
        assert_eq!(body.into_packet(), packet);
    }

    #[tokio::test]
    async fn receive_filters_on_packet_id() {
        let (client, server) = session_pair(TransportOpts::multiplexed());
        let probe = Packet::new().with_id(7u16);
        let mut only_seven = server.receive(Some(&probe));

        client
            .send(&Packet::new().with_id(6u16).with_payload(&b"six"[..]))
            .await
            .expect("send 6");
        client
            .send(&Packet::new().with_id(7u16).with_payload(&b"seven"[..]))
            .await
            .expect("send 7");

        let event = only_seven.recv().await.expect("event").expect("open");
        assert_eq!(event.stream_id(), Some(7));
        assert_eq!(event.packet().payload.as_deref(), Some(&b"seven"[..]));
    }

    #[tokio::test]
    async fn streamed_body_ends_with_end_event() {
        let (client, server) = session_pair(TransportOpts::multiplexed());
        let mut inbound = server.receive(None);

        client.send_chunk(Some(3), b"part-1").await.expect("chunk 1");
        client.send_chunk(Some(3), b"part-2").await.expect("chunk 2");
        client.end_stream(Some(3)).await.expect("end");

        let mut body = Vec::new();
        loop {
            match inbound.recv().await.expect("event").expect("open") {
                PacketEvent::Body(packet) => body.extend_from_slice(&packet.payload.unwrap()),
                PacketEvent::End(packet) => {
                    assert_eq!(packet.stream_id(), Some(3));
                    break;
                }
                PacketEvent::Head(_) => panic!("no header frame was sent"),
            }
        }
        assert_eq!(body, b"part-1part-2");
    }

    #[tokio::test]
    async fn oversized_packet_is_rejected_before_write() {
        let (client, server) = session_pair(TransportOpts::multiplexed().with_max_size(8));
        let mut inbound = server.receive(None);

        let err = client
            .send(&Packet::new().with_id(1u16).with_payload(vec![0u8; 9]))
            .await
            .expect_err("too large");
        assert!(matches!(
            err,
            SessionError::Frame(FrameError::PacketTooLarge { size: 9, max: 8 })
        ));

        client
            .send(&Packet::new().with_id(2u16).with_payload(&b"ok"[..]))
            .await
            .expect("small packet still goes through");
        let event = inbound.recv().await.expect("event").expect("open");
        assert_eq!(event.stream_id(), Some(2));
    }

    #[tokio::test]
    async fn serialize_deserialize_are_inverse() {
        let (client, _server) = session_pair(TransportOpts::multiplexed());
        let packet = Packet::new()
            .with_id(11u16)
            .with_header("x-trace", vec!["a", "b"])
            .with_header("retries", 2u16)
            .with_payload(&b"{\"ok\":true}"[..]);

        let bytes = client.serialize(&packet, true).expect("serialize");
        assert_eq!(client.deserialize(&bytes).expect("deserialize"), packet);

        let head_only = client.serialize(&packet, false).expect("serialize head");
        let decoded = client.deserialize(&head_only).expect("deserialize head");
        assert_eq!(decoded.headers, packet.headers);
        assert!(decoded.payload.is_none());
    }

    #[tokio::test]
    async fn destroy_resolves_pending_receives_and_rejects_sends() {
        let (client, server) = session_pair(TransportOpts::multiplexed());
        let mut inbound = client.receive(None);

        let waiter = tokio::spawn(async move { inbound.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(client.destroy().await);
        assert!(!client.destroy().await);
        assert!(client.is_closed());

        let outcome = waiter.await.expect("waiter task");
        assert!(matches!(outcome, Some(Err(SessionError::ConnectionClosed))));
        assert!(matches!(
            client.send(&Packet::new().with_id(1u16)).await,
            Err(SessionError::ConnectionClosed)
        ));

        // The peer sees EOF and tears down too.
        tokio::time::timeout(Duration::from_secs(5), server.closed())
            .await
            .expect("server should observe close");
    }
}
