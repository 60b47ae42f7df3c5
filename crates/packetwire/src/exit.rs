use std::fmt;
use std::io;

use packetwire_frame::FrameError;
use packetwire_session::SessionError;
use packetwire_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(USAGE, message)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::NotFound
        | io::ErrorKind::AddrInUse
        | io::ErrorKind::ConnectionReset => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::PathTooLong { .. } | TransportError::InvalidEndpoint(_) => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::InvalidDelimiter(_) => CliError::new(USAGE, format!("{context}: {err}")),
        FrameError::PacketTooLarge { .. }
        | FrameError::DelimiterInBody
        | FrameError::UnencodableId(_)
        | FrameError::InvalidJson(_)
        | FrameError::Encoding(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn session_error(context: &str, err: SessionError) -> CliError {
    match err {
        SessionError::Transport(err) => transport_error(context, err),
        SessionError::Frame(err) => frame_error(context, err),
        SessionError::RequestTimeout(_) | SessionError::IdleTimeout(_) => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        SessionError::NotMultiplexed => CliError::new(USAGE, format!("{context}: {err}")),
        SessionError::ConnectionClosed | SessionError::Cancelled => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn timeouts_map_to_124() {
        let err = session_error("request failed", SessionError::RequestTimeout(Duration::from_secs(1)));
        assert_eq!(err.code, TIMEOUT);
        assert!(err.message.starts_with("request failed: "));

        let connect = TransportError::Connect {
            endpoint: packetwire_transport::Endpoint::tcp("127.0.0.1:1"),
            source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
        };
        assert_eq!(session_error("connect failed", connect.into()).code, TIMEOUT);
    }

    #[test]
    fn bad_packets_are_data_errors() {
        let err = session_error(
            "send failed",
            FrameError::PacketTooLarge { size: 10, max: 1 }.into(),
        );
        assert_eq!(err.code, DATA_INVALID);
        assert_eq!(
            frame_error("opts", FrameError::InvalidDelimiter("empty")).code,
            USAGE
        );
    }

    #[test]
    fn closed_connection_is_plain_failure() {
        assert_eq!(
            session_error("receive failed", SessionError::ConnectionClosed).code,
            FAILURE
        );
        assert_eq!(
            session_error("alloc", SessionError::IdsExhausted(3)).code,
            INTERNAL
        );
        assert_eq!(
            session_error("correlate", SessionError::NotMultiplexed).code,
            USAGE
        );
    }
}
