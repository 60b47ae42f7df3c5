//! Delimiter-framed packet codec with stream-id multiplexing.
//!
//! Every packet travels as one or more frames:
//! - A 1-byte tag (`1` header, `2` payload, `0` end-of-stream)
//! - A 2-byte big-endian stream id, on multiplexed connections only
//! - The frame body (JSON headers or opaque payload bytes)
//! - The configured delimiter
//!
//! [`FrameParser`] turns arbitrarily chunked socket reads back into frames,
//! and [`PacketAssembler`] pairs payload frames with the headers that opened
//! their stream.

pub mod assembler;
pub mod codec;
pub mod config;
pub mod error;
pub mod headers;
pub mod packet;
pub mod parser;

pub use assembler::{PacketAssembler, PacketEvent};
pub use codec::{
    decode_packet, encode_chunk, encode_end, encode_frame, encode_packet, Frame, FrameCodec,
    END_TAG, HEADER_TAG, NO_STREAM_ID, PAYLOAD_TAG, STREAM_ID_SIZE,
};
pub use config::{Encoding, TransportOpts, DEFAULT_DELIMITER, DEFAULT_MAX_SIZE};
pub use error::{FrameError, Result};
pub use headers::{HeaderValue, Headers};
pub use packet::{Packet, PacketId};
pub use parser::FrameParser;
