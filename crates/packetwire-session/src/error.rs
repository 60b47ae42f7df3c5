use std::time::Duration;

/// Errors that can occur in session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] packetwire_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] packetwire_frame::FrameError),

    /// The connection was destroyed, locally or by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// No response arrived for a request in time.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Nothing was read from the connection for the configured timeout.
    #[error("connection idle for {0:?}")]
    IdleTimeout(Duration),

    /// Every stream id in the allocator's range is in flight.
    #[error("stream ids exhausted ({0} in flight)")]
    IdsExhausted(usize),

    /// Request correlation needs stream ids on the wire.
    #[error("session does not carry stream ids")]
    NotMultiplexed,

    /// The operation was cancelled by its caller.
    #[error("operation cancelled")]
    Cancelled,
}

impl SessionError {
    /// True when the connection is still usable after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SessionError::Frame(err) => err.is_recoverable(),
            SessionError::RequestTimeout(_) | SessionError::IdleTimeout(_) => true,
            SessionError::IdsExhausted(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
