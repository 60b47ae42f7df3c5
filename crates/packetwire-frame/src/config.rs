use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;

use crate::codec::{END_TAG, HEADER_TAG, PAYLOAD_TAG, STREAM_ID_SIZE};
use crate::error::{FrameError, Result};

/// Default delimiter: ASCII record separator followed by CRLF.
///
/// `serde_json` escapes control characters inside strings and emits compact
/// output, so this sequence never occurs in an encoded header body.
pub const DEFAULT_DELIMITER: &[u8] = b"\x1e\r\n";

/// Default maximum frame body size: 10 MiB.
pub const DEFAULT_MAX_SIZE: usize = 10 * 1024 * 1024;

const MAX_DELIMITER_LEN: usize = 16;

/// Text encoding used by the string payload helpers.
///
/// Header bodies are always UTF-8 JSON regardless of this setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Latin1,
}

impl Encoding {
    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        match self {
            Encoding::Utf8 => String::from_utf8(bytes.to_vec())
                .map_err(|err| FrameError::Encoding(err.to_string())),
            Encoding::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }

    pub fn encode(self, text: &str) -> Result<Vec<u8>> {
        match self {
            Encoding::Utf8 => Ok(text.as_bytes().to_vec()),
            Encoding::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(u32::from(c)).map_err(|_| {
                        FrameError::Encoding(format!("character {c:?} is not representable in latin1"))
                    })
                })
                .collect(),
        }
    }
}

impl FromStr for Encoding {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "latin1" | "iso-8859-1" | "binary" => Ok(Encoding::Latin1),
            other => Err(FrameError::Encoding(format!("unknown encoding: {other}"))),
        }
    }
}

/// Framing options shared by both ends of a connection.
#[derive(Debug, Clone)]
pub struct TransportOpts {
    /// Byte sequence terminating every frame.
    pub delimiter: Bytes,
    /// Maximum body size of a single frame, inbound and outbound.
    pub max_size: usize,
    /// Encoding for string payload helpers.
    pub encoding: Encoding,
    /// Idle timeout on reads and default per-request timeout. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Carry a 2-byte stream id after every tag (client/microservice framing).
    pub multiplexed: bool,
}

impl Default for TransportOpts {
    fn default() -> Self {
        Self {
            delimiter: Bytes::from_static(DEFAULT_DELIMITER),
            max_size: DEFAULT_MAX_SIZE,
            encoding: Encoding::Utf8,
            timeout: None,
            multiplexed: false,
        }
    }
}

impl TransportOpts {
    /// Default options with stream ids enabled.
    pub fn multiplexed() -> Self {
        Self {
            multiplexed: true,
            ..Self::default()
        }
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<Bytes>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_multiplexed(mut self, multiplexed: bool) -> Self {
        self.multiplexed = multiplexed;
        self
    }

    /// Bytes before the body of every frame: tag plus optional stream id.
    pub fn prefix_len(&self) -> usize {
        if self.multiplexed {
            1 + STREAM_ID_SIZE
        } else {
            1
        }
    }

    /// Check that these options can frame a byte stream unambiguously.
    pub fn validate(&self) -> Result<()> {
        let Some(&first) = self.delimiter.first() else {
            return Err(FrameError::InvalidDelimiter("delimiter must not be empty"));
        };
        if self.delimiter.len() > MAX_DELIMITER_LEN {
            return Err(FrameError::InvalidDelimiter("delimiter longer than 16 bytes"));
        }
        // Padding detection relies on a delimiter never starting like a frame.
        if matches!(first, END_TAG | HEADER_TAG | PAYLOAD_TAG) {
            return Err(FrameError::InvalidDelimiter(
                "delimiter must not start with a frame tag byte",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let opts = TransportOpts::default();
        opts.validate().unwrap();
        assert_eq!(opts.prefix_len(), 1);
        assert_eq!(TransportOpts::multiplexed().prefix_len(), 3);
        assert_eq!(opts.max_size, 10 * 1024 * 1024);
    }

    #[test]
    fn rejects_ambiguous_delimiters() {
        let empty = TransportOpts::default().with_delimiter(Bytes::new());
        assert!(matches!(empty.validate(), Err(FrameError::InvalidDelimiter(_))));

        let tag_like = TransportOpts::default().with_delimiter(&b"\x01\n"[..]);
        assert!(matches!(tag_like.validate(), Err(FrameError::InvalidDelimiter(_))));

        let newline = TransportOpts::default().with_delimiter(&b"\n"[..]);
        newline.validate().unwrap();
    }

    #[test]
    fn latin1_round_trip_and_limits() {
        let bytes = Encoding::Latin1.encode("café").unwrap();
        assert_eq!(bytes, vec![b'c', b'a', b'f', 0xE9]);
        assert_eq!(Encoding::Latin1.decode(&bytes).unwrap(), "café");
        assert!(Encoding::Latin1.encode("€").is_err());
        assert!(Encoding::Utf8.decode(&[0xFF]).is_err());
    }

    #[test]
    fn parses_encoding_names() {
        assert_eq!("UTF-8".parse::<Encoding>().unwrap(), Encoding::Utf8);
        assert_eq!("latin1".parse::<Encoding>().unwrap(), Encoding::Latin1);
        assert!("ebcdic".parse::<Encoding>().is_err());
    }
}
