use std::fmt;

use bytes::Bytes;

use crate::config::Encoding;
use crate::error::Result;
use crate::headers::{HeaderValue, Headers};

/// Identifies a packet. Only `Stream` ids fit the wire's stream id slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PacketId {
    Stream(u16),
    Name(String),
}

impl PacketId {
    pub fn stream(&self) -> Option<u16> {
        match self {
            PacketId::Stream(id) => Some(*id),
            PacketId::Name(_) => None,
        }
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketId::Stream(id) => write!(f, "{id}"),
            PacketId::Name(name) => f.write_str(name),
        }
    }
}

impl From<u16> for PacketId {
    fn from(id: u16) -> Self {
        PacketId::Stream(id)
    }
}

impl From<&str> for PacketId {
    fn from(name: &str) -> Self {
        PacketId::Name(name.to_string())
    }
}

impl From<String> for PacketId {
    fn from(name: String) -> Self {
        PacketId::Name(name)
    }
}

/// The logical message: id, headers and an optional payload.
///
/// A `None` payload marks a header-only packet (or, with no headers either,
/// a bare end-of-stream marker).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packet {
    pub id: Option<PacketId>,
    pub headers: Headers,
    pub payload: Option<Bytes>,
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<PacketId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Attach `text` as the payload, encoded with `encoding`.
    pub fn with_text(self, text: &str, encoding: Encoding) -> Result<Self> {
        let bytes = encoding.encode(text)?;
        Ok(self.with_payload(bytes))
    }

    /// Numeric stream id, if the packet carries one.
    pub fn stream_id(&self) -> Option<u16> {
        self.id.as_ref().and_then(PacketId::stream)
    }

    /// Payload decoded as text with `encoding`.
    pub fn text(&self, encoding: Encoding) -> Result<Option<String>> {
        self.payload
            .as_deref()
            .map(|bytes| encoding.decode(bytes))
            .transpose()
    }

    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Bytes::len)
    }

    /// True for a packet with neither headers nor payload.
    pub fn is_end_marker(&self) -> bool {
        self.headers.is_empty() && self.payload.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let packet = Packet::new()
            .with_id(7u16)
            .with_header("content-type", "json")
            .with_payload(&b"{}"[..]);

        assert_eq!(packet.stream_id(), Some(7));
        assert_eq!(packet.headers.get_str("Content-Type"), Some("json"));
        assert_eq!(packet.payload_len(), 2);
        assert!(!packet.is_end_marker());
    }

    #[test]
    fn named_ids_have_no_stream_id() {
        let packet = Packet::new().with_id("req-1");
        assert_eq!(packet.stream_id(), None);
        assert_eq!(packet.id.unwrap().to_string(), "req-1");
    }

    #[test]
    fn text_helpers_use_encoding() {
        let packet = Packet::new().with_text("ñ", Encoding::Latin1).unwrap();
        assert_eq!(packet.payload.as_deref(), Some(&[0xF1][..]));
        assert_eq!(packet.text(Encoding::Latin1).unwrap().as_deref(), Some("ñ"));
        assert!(Packet::new().text(Encoding::Utf8).unwrap().is_none());
        assert!(Packet::new().is_end_marker());
    }
}
