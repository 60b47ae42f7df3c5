use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::{Frame, FrameCodec};
use crate::config::TransportOpts;
use crate::error::Result;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Push-based frame parser: feed socket chunks in, get complete frames out.
///
/// Chunks may split frames anywhere, including inside the tag, the stream id
/// or the delimiter. Bytes that don't form a complete frame yet stay pending
/// until the next [`push`](Self::push).
pub struct FrameParser {
    codec: FrameCodec,
    pending: BytesMut,
}

impl FrameParser {
    pub fn new(opts: TransportOpts) -> Result<Self> {
        Ok(Self {
            codec: FrameCodec::new(opts)?,
            pending: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        })
    }

    /// Append `chunk` and extract every frame it completes, in wire order.
    ///
    /// Per-frame failures (bad JSON, unknown tag, oversized frame) appear
    /// in place as `Err` entries; parsing continues past them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Frame>> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            match self.codec.decode(&mut self.pending) {
                Ok(Some(frame)) => frames.push(Ok(frame)),
                Ok(None) => break,
                Err(err) => frames.push(Err(err)),
            }
        }
        frames
    }

    /// Signal end of input. Fails if a partial frame is still pending.
    pub fn finish(&mut self) -> Result<()> {
        // `push` already drained every complete frame.
        self.codec.decode_eof(&mut self.pending)?;
        Ok(())
    }

    /// Number of buffered bytes not yet forming a frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn opts(&self) -> &TransportOpts {
        self.codec.opts()
    }
}
