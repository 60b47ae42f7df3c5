use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::assembler::{PacketAssembler, PacketEvent};
use crate::config::TransportOpts;
use crate::error::{FrameError, Result};
use crate::headers::Headers;
use crate::packet::{Packet, PacketId};
use crate::parser::FrameParser;

/// Tag of an end-of-stream marker frame (empty body).
pub const END_TAG: u8 = 0;
/// Tag of a header frame (UTF-8 JSON object body).
pub const HEADER_TAG: u8 = 1;
/// Tag of a payload frame (opaque body).
pub const PAYLOAD_TAG: u8 = 2;
/// Size of the big-endian stream id following the tag on multiplexed connections.
pub const STREAM_ID_SIZE: usize = 2;
/// Stream id written when a packet has no id. Never handed out by allocators.
pub const NO_STREAM_ID: u16 = 0;

/// One delimited unit on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Header {
        stream_id: Option<u16>,
        headers: Headers,
    },
    Payload {
        stream_id: Option<u16>,
        body: Bytes,
    },
    EndOfStream {
        stream_id: Option<u16>,
    },
}

impl Frame {
    pub fn tag(&self) -> u8 {
        match self {
            Frame::Header { .. } => HEADER_TAG,
            Frame::Payload { .. } => PAYLOAD_TAG,
            Frame::EndOfStream { .. } => END_TAG,
        }
    }

    pub fn stream_id(&self) -> Option<u16> {
        match self {
            Frame::Header { stream_id, .. }
            | Frame::Payload { stream_id, .. }
            | Frame::EndOfStream { stream_id } => *stream_id,
        }
    }
}

fn find_delimiter(haystack: &[u8], delimiter: &[u8]) -> Option<usize> {
    if haystack.len() < delimiter.len() {
        return None;
    }
    haystack
        .windows(delimiter.len())
        .position(|window| window == delimiter)
}

fn wire_stream_id(id: Option<&PacketId>, opts: &TransportOpts) -> Result<Option<u16>> {
    if !opts.multiplexed {
        return Ok(None);
    }
    match id {
        None => Ok(Some(NO_STREAM_ID)),
        Some(PacketId::Stream(id)) => check_stream_id(Some(*id)),
        Some(PacketId::Name(name)) => Err(FrameError::UnencodableId(name.clone())),
    }
}

/// Stream id 0 is reserved for "no id" and would decode as `None`.
fn check_stream_id(stream_id: Option<u16>) -> Result<Option<u16>> {
    match stream_id {
        Some(NO_STREAM_ID) => Err(FrameError::UnencodableId(NO_STREAM_ID.to_string())),
        other => Ok(other),
    }
}

fn check_body(body: &[u8], opts: &TransportOpts) -> Result<()> {
    if body.len() > opts.max_size {
        return Err(FrameError::PacketTooLarge {
            size: body.len(),
            max: opts.max_size,
        });
    }
    if find_delimiter(body, &opts.delimiter).is_some() {
        return Err(FrameError::DelimiterInBody);
    }
    Ok(())
}

/// Append one already-validated frame to `dst`.
fn put_frame(tag: u8, stream_id: Option<u16>, body: &[u8], opts: &TransportOpts, dst: &mut BytesMut) {
    dst.reserve(opts.prefix_len() + body.len() + opts.delimiter.len());
    dst.put_u8(tag);
    if opts.multiplexed {
        dst.put_u16(stream_id.unwrap_or(NO_STREAM_ID));
    }
    dst.put_slice(body);
    dst.put_slice(&opts.delimiter);
}

/// Encode a single frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌───────────┬──────────────────┬──────────────┬─────────────┐
/// │ Tag (1B)  │ Stream id        │ Body         │ Delimiter   │
/// │ 0 / 1 / 2 │ (2B BE, optional)│ (N bytes)    │             │
/// └───────────┴──────────────────┴──────────────┴─────────────┘
/// ```
///
/// Nothing is written to `dst` if the frame is rejected.
pub fn encode_frame(frame: &Frame, opts: &TransportOpts, dst: &mut BytesMut) -> Result<()> {
    check_stream_id(frame.stream_id())?;
    match frame {
        Frame::Header { stream_id, headers } => {
            let body = serde_json::to_vec(headers)?;
            check_body(&body, opts)?;
            put_frame(HEADER_TAG, *stream_id, &body, opts, dst);
        }
        Frame::Payload { stream_id, body } => {
            check_body(body, opts)?;
            put_frame(PAYLOAD_TAG, *stream_id, body, opts, dst);
        }
        Frame::EndOfStream { stream_id } => put_frame(END_TAG, *stream_id, &[], opts, dst),
    }
    Ok(())
}

/// Encode a packet as its frames: a header frame when headers are present,
/// then a payload frame, or an end-of-stream frame when the payload is `None`.
///
/// All frames are validated before any byte is appended, so a rejected
/// packet leaves `dst` untouched.
pub fn encode_packet(packet: &Packet, opts: &TransportOpts, dst: &mut BytesMut) -> Result<()> {
    let stream_id = wire_stream_id(packet.id.as_ref(), opts)?;

    let header_body = if packet.headers.is_empty() {
        None
    } else {
        let body = serde_json::to_vec(&packet.headers)?;
        check_body(&body, opts)?;
        Some(body)
    };
    if let Some(payload) = &packet.payload {
        check_body(payload, opts)?;
    }

    if let Some(body) = &header_body {
        put_frame(HEADER_TAG, stream_id, body, opts, dst);
    }
    match &packet.payload {
        Some(payload) => put_frame(PAYLOAD_TAG, stream_id, payload, opts, dst),
        None => put_frame(END_TAG, stream_id, &[], opts, dst),
    }
    Ok(())
}

/// Encode one chunk of a streaming body as a payload frame.
pub fn encode_chunk(
    stream_id: Option<u16>,
    body: &[u8],
    opts: &TransportOpts,
    dst: &mut BytesMut,
) -> Result<()> {
    check_stream_id(stream_id)?;
    check_body(body, opts)?;
    put_frame(PAYLOAD_TAG, stream_id, body, opts, dst);
    Ok(())
}

/// Encode the end-of-stream marker closing a streaming body.
///
/// `Some(0)` is written the same as `None`.
pub fn encode_end(stream_id: Option<u16>, opts: &TransportOpts, dst: &mut BytesMut) {
    put_frame(END_TAG, stream_id, &[], opts, dst);
}

/// Decode a complete byte image of one packet (as produced by
/// [`encode_packet`]) without touching any connection.
///
/// Multiple payload frames are concatenated in order.
pub fn decode_packet(bytes: &[u8], opts: &TransportOpts) -> Result<Packet> {
    let mut parser = FrameParser::new(opts.clone())?;
    let mut assembler = PacketAssembler::new();
    let mut packet: Option<Packet> = None;
    let mut body: Option<BytesMut> = None;

    for decoded in parser.push(bytes) {
        match assembler.accept(decoded?) {
            PacketEvent::Head(head) => packet = Some(head),
            PacketEvent::Body(chunk) => {
                if let Some(payload) = &chunk.payload {
                    body.get_or_insert_with(BytesMut::new)
                        .extend_from_slice(payload);
                }
                packet = Some(Packet {
                    payload: None,
                    ..chunk
                });
            }
            PacketEvent::End(end) => {
                if packet.is_none() {
                    packet = Some(end);
                }
                break;
            }
        }
    }
    parser.finish()?;

    let mut packet = packet.ok_or(FrameError::Truncated { pending: 0 })?;
    if let Some(body) = body {
        packet.payload = Some(body.freeze());
    }
    Ok(packet)
}

/// Incremental frame codec for `tokio_util::codec`.
///
/// Decoding keeps two pieces of state between calls: the offset up to which
/// the buffered bytes were already searched for the delimiter, and whether an
/// oversized frame is being skipped.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    opts: TransportOpts,
    scanned: usize,
    discarding: bool,
}

impl FrameCodec {
    /// Create a codec, rejecting options that cannot frame unambiguously.
    pub fn new(opts: TransportOpts) -> Result<Self> {
        opts.validate()?;
        Ok(Self {
            opts,
            scanned: 0,
            discarding: false,
        })
    }

    pub fn opts(&self) -> &TransportOpts {
        &self.opts
    }

    /// True while bytes of an oversized frame are being dropped.
    pub fn is_discarding(&self) -> bool {
        self.discarding
    }

    /// Drop bytes up to and including the next delimiter.
    ///
    /// Returns `false` when more input is needed.
    fn skip_oversized(&mut self, src: &mut BytesMut) -> bool {
        let delimiter_len = self.opts.delimiter.len();
        match find_delimiter(src, &self.opts.delimiter) {
            Some(pos) => {
                src.advance(pos + delimiter_len);
                self.discarding = false;
                self.scanned = 0;
                trace!(skipped = pos, "resynchronised after oversized frame");
                true
            }
            None => {
                // Keep a possible delimiter prefix at the tail.
                let keep = delimiter_len - 1;
                if src.len() > keep {
                    let drop = src.len() - keep;
                    src.advance(drop);
                }
                false
            }
        }
    }

    fn decode_body(&self, tag: u8, stream_id: Option<u16>, body: Bytes) -> Result<Frame> {
        match tag {
            HEADER_TAG => {
                let headers: Headers = serde_json::from_slice(&body)?;
                Ok(Frame::Header { stream_id, headers })
            }
            PAYLOAD_TAG => Ok(Frame::Payload { stream_id, body }),
            END_TAG => Ok(Frame::EndOfStream { stream_id }),
            other => Err(FrameError::InvalidTag(other)),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    /// Decode the next frame from `src`.
    ///
    /// Returns `Ok(None)` if `src` doesn't hold a complete frame yet. Errors
    /// are per frame: the offending bytes have already been consumed, so the
    /// next call continues with the following frame.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let delimiter_len = self.opts.delimiter.len();
        let prefix = self.opts.prefix_len();

        loop {
            if self.discarding && !self.skip_oversized(src) {
                return Ok(None);
            }
            if src.is_empty() {
                return Ok(None);
            }

            // A delimiter where a tag should be is padding.
            if src[0] == self.opts.delimiter[0] {
                if src.len() < delimiter_len {
                    if self.opts.delimiter.starts_with(&src[..]) {
                        return Ok(None);
                    }
                } else if src.starts_with(&self.opts.delimiter) {
                    src.advance(delimiter_len);
                    continue;
                }
            }

            if src.len() < prefix {
                return Ok(None); // Need more data
            }

            // The stream id is binary; never search it for the delimiter.
            let from = self.scanned.max(prefix);
            let Some(offset) = find_delimiter(&src[from..], &self.opts.delimiter) else {
                let body_len = src.len() - prefix;
                if body_len >= self.opts.max_size + delimiter_len {
                    // The frame's end is not known yet; `size` is only what has arrived.
                    self.discarding = true;
                    self.scanned = 0;
                    let keep = delimiter_len - 1;
                    let drop = src.len() - keep;
                    src.advance(drop);
                    return Err(FrameError::PacketTooLarge {
                        size: body_len,
                        max: self.opts.max_size,
                    });
                }
                self.scanned = (src.len() + 1).saturating_sub(delimiter_len).max(prefix);
                return Ok(None); // Need more data
            };

            let body_end = from + offset;
            self.scanned = 0;
            let mut raw = src.split_to(body_end);
            src.advance(delimiter_len);

            let body_len = body_end - prefix;
            if body_len > self.opts.max_size {
                return Err(FrameError::PacketTooLarge {
                    size: body_len,
                    max: self.opts.max_size,
                });
            }

            let tag = raw[0];
            let stream_id = if self.opts.multiplexed {
                let id = u16::from_be_bytes([raw[1], raw[2]]);
                (id != NO_STREAM_ID).then_some(id)
            } else {
                None
            };
            raw.advance(prefix);

            return self.decode_body(tag, stream_id, raw.freeze()).map(Some);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() || self.discarding => {
                src.clear();
                Ok(None)
            }
            None => {
                let pending = src.len();
                src.clear();
                Err(FrameError::Truncated { pending })
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        encode_frame(&frame, &self.opts, dst)
    }
}

impl<'a> Encoder<&'a Packet> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, packet: &'a Packet, dst: &mut BytesMut) -> Result<()> {
        encode_packet(packet, &self.opts, dst)
    }
}
