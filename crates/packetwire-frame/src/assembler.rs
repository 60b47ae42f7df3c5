use std::collections::HashMap;

use crate::codec::Frame;
use crate::headers::Headers;
use crate::packet::{Packet, PacketId};

/// A decoded frame lifted to packet level.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketEvent {
    /// Headers are known for a stream; the payload (if any) follows.
    Head(Packet),
    /// A payload frame, carrying the headers of its stream when known.
    Body(Packet),
    /// The stream ended; carries the stream's headers when known.
    End(Packet),
}

impl PacketEvent {
    pub fn packet(&self) -> &Packet {
        match self {
            PacketEvent::Head(packet) | PacketEvent::Body(packet) | PacketEvent::End(packet) => {
                packet
            }
        }
    }

    pub fn into_packet(self) -> Packet {
        match self {
            PacketEvent::Head(packet) | PacketEvent::Body(packet) | PacketEvent::End(packet) => {
                packet
            }
        }
    }

    pub fn stream_id(&self) -> Option<u16> {
        self.packet().stream_id()
    }

    pub fn is_head(&self) -> bool {
        matches!(self, PacketEvent::Head(_))
    }

    pub fn is_end(&self) -> bool {
        matches!(self, PacketEvent::End(_))
    }
}

/// Pairs payload and end frames with the header frame that opened their stream.
///
/// Headers are remembered per stream id (or for the single unkeyed stream on
/// connections without ids) until an end-of-stream frame closes the stream or
/// a new header frame reopens it. The table is therefore bounded by the
/// stream id space.
#[derive(Debug, Default)]
pub struct PacketAssembler {
    open: HashMap<Option<u16>, Headers>,
}

impl PacketAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, frame: Frame) -> PacketEvent {
        match frame {
            Frame::Header { stream_id, headers } => {
                self.open.insert(stream_id, headers.clone());
                PacketEvent::Head(Packet {
                    id: stream_id.map(PacketId::Stream),
                    headers,
                    payload: None,
                })
            }
            Frame::Payload { stream_id, body } => PacketEvent::Body(Packet {
                id: stream_id.map(PacketId::Stream),
                headers: self.open.get(&stream_id).cloned().unwrap_or_default(),
                payload: Some(body),
            }),
            Frame::EndOfStream { stream_id } => PacketEvent::End(Packet {
                id: stream_id.map(PacketId::Stream),
                headers: self.open.remove(&stream_id).unwrap_or_default(),
                payload: None,
            }),
        }
    }

    /// Number of streams with headers but no end marker yet.
    pub fn open_streams(&self) -> usize {
        self.open.len()
    }
}
