use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TransportError};

/// Where a socket connects to or listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A TCP `host:port` address. Resolution happens at connect/bind time.
    Tcp(String),
    /// A filesystem-path Unix domain socket.
    Ipc(PathBuf),
}

impl Endpoint {
    /// TCP endpoint from anything that renders as `host:port`.
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::Tcp(addr.into())
    }

    /// IPC endpoint at a socket path.
    pub fn ipc(path: impl AsRef<Path>) -> Self {
        Self::Ipc(path.as_ref().to_path_buf())
    }

    /// Parse `tcp://host:port`, `ipc:///path`, a bare `host:port`, or a bare
    /// absolute/relative path.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TransportError::InvalidEndpoint(
                "endpoint must not be empty".to_string(),
            ));
        }

        if let Some(addr) = input.strip_prefix("tcp://") {
            return parse_tcp(addr);
        }
        if let Some(path) = input.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(TransportError::InvalidEndpoint(input.to_string()));
            }
            return Ok(Self::Ipc(PathBuf::from(path)));
        }
        if input.contains("://") {
            return Err(TransportError::InvalidEndpoint(format!(
                "unsupported scheme: {input}"
            )));
        }
        if input.starts_with('/') || input.starts_with('.') {
            return Ok(Self::Ipc(PathBuf::from(input)));
        }
        parse_tcp(input)
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match self {
            Endpoint::Tcp(_) => "tcp",
            Endpoint::Ipc(_) => "unix-domain-socket",
        }
    }
}

fn parse_tcp(addr: &str) -> Result<Endpoint> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err(TransportError::InvalidEndpoint(format!(
            "missing port in {addr}"
        )));
    };
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(TransportError::InvalidEndpoint(addr.to_string()));
    }
    Ok(Endpoint::Tcp(addr.to_string()))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Client socket options, handed to the platform socket library as-is.
#[derive(Debug, Clone)]
pub struct ConnectOpts {
    /// Remote endpoint.
    pub endpoint: Endpoint,
    /// Give up on the attempt after this long. `None` waits for the OS.
    pub connect_timeout: Option<Duration>,
    /// Disable Nagle's algorithm on TCP sockets.
    pub nodelay: bool,
}

impl ConnectOpts {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connect_timeout: None,
            nodelay: true,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

/// Server socket options.
#[derive(Debug, Clone)]
pub struct ListenOpts {
    /// Local endpoint to bind.
    pub endpoint: Endpoint,
    /// Permission mode applied to IPC socket paths.
    pub socket_mode: u32,
}

impl ListenOpts {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            socket_mode: Self::DEFAULT_SOCKET_MODE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_schemes_and_bare_forms() {
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:4000").unwrap(),
            Endpoint::Tcp("127.0.0.1:4000".to_string())
        );
        assert_eq!(
            Endpoint::parse("localhost:80").unwrap(),
            Endpoint::Tcp("localhost:80".to_string())
        );
        assert_eq!(
            Endpoint::parse("ipc:///tmp/pw.sock").unwrap(),
            Endpoint::Ipc(PathBuf::from("/tmp/pw.sock"))
        );
        assert_eq!(
            Endpoint::parse("/tmp/pw.sock").unwrap(),
            Endpoint::Ipc(PathBuf::from("/tmp/pw.sock"))
        );
    }

    #[test]
    fn rejects_malformed_endpoints() {
        assert!(Endpoint::parse("").is_err());
        assert!(Endpoint::parse("localhost").is_err());
        assert!(Endpoint::parse("tcp://host:notaport").is_err());
        assert!(Endpoint::parse("udp://host:1").is_err());
        assert!(Endpoint::parse("ipc://").is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for raw in ["tcp://[::1]:9000", "ipc:///var/run/x.sock"] {
            let endpoint = Endpoint::parse(raw).unwrap();
            assert_eq!(endpoint.to_string(), raw);
            assert_eq!(Endpoint::parse(&endpoint.to_string()).unwrap(), endpoint);
        }
    }
}
