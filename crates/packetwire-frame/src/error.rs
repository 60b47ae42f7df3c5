/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A frame body exceeds the configured maximum size.
    ///
    /// For inbound frames rejected before their delimiter arrived, `size` is
    /// the number of body bytes received so far, a lower bound on the real size.
    #[error("packet too large ({size} bytes, max {max})")]
    PacketTooLarge { size: usize, max: usize },

    /// A header frame body is not a valid JSON header object.
    #[error("invalid header json: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// A frame starts with a byte that is not a known tag.
    #[error("invalid frame tag {0:#04x}")]
    InvalidTag(u8),

    /// A frame body contains the delimiter and cannot be framed.
    #[error("frame body contains the delimiter sequence")]
    DelimiterInBody,

    /// The configured delimiter cannot be used for framing.
    #[error("invalid delimiter: {0}")]
    InvalidDelimiter(&'static str),

    /// The packet id cannot be carried in the 2-byte stream id slot.
    #[error("packet id {0:?} cannot be encoded as a stream id")]
    UnencodableId(String),

    /// Text could not be converted with the configured encoding.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Input ended in the middle of a frame.
    #[error("truncated frame ({pending} bytes pending)")]
    Truncated { pending: usize },
}

impl FrameError {
    /// Whether decoding can carry on with the next frame after this error.
    ///
    /// Recoverable errors affect a single frame only; the connection stays up.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FrameError::PacketTooLarge { .. } | FrameError::InvalidJson(_) | FrameError::InvalidTag(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
