use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use packetwire_frame::{Encoding, TransportOpts, DEFAULT_MAX_SIZE};
use packetwire_transport::Endpoint;

use crate::exit::{frame_error, CliError, CliResult, INTERNAL};
use crate::output::OutputFormat;

pub mod listen;
pub mod request;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept connections and echo every packet back to its sender.
    Serve(ServeArgs),
    /// Send one request and print the correlated response.
    Request(RequestArgs),
    /// Accept connections and print received packets.
    Listen(ListenArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, framing: &FramingArgs, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Version(args) => version::run(args),
        Command::Serve(args) => block_on(serve::run(args, framing.transport_opts()?)),
        Command::Request(args) => block_on(request::run(args, framing.transport_opts()?, format)),
        Command::Listen(args) => block_on(listen::run(args, framing.transport_opts()?, format)),
    }
}

fn block_on<F>(future: F) -> CliResult<i32>
where
    F: Future<Output = CliResult<i32>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::new(INTERNAL, format!("runtime setup failed: {err}")))?;
    runtime.block_on(future)
}

/// Framing flags shared by every networked command. Both ends must agree.
#[derive(Args, Debug, Clone)]
pub struct FramingArgs {
    /// Frame delimiter; accepts `\n`, `\r`, `\t`, `\\` and `\xHH` escapes.
    #[arg(
        long,
        global = true,
        env = "PACKETWIRE_DELIMITER",
        default_value = "\\x1e\\r\\n",
        value_parser = parse_delimiter
    )]
    pub delimiter: Delimiter,

    /// Maximum frame body size in bytes.
    #[arg(long, global = true, env = "PACKETWIRE_MAX_SIZE", default_value_t = DEFAULT_MAX_SIZE)]
    pub max_size: usize,

    /// Text encoding for payload display and string payloads (utf8, latin1).
    #[arg(long, global = true, env = "PACKETWIRE_ENCODING", default_value = "utf8", value_parser = parse_encoding)]
    pub encoding: Encoding,

    /// Omit the 2-byte stream id from every frame.
    #[arg(long, global = true, env = "PACKETWIRE_NO_STREAM_IDS")]
    pub no_stream_ids: bool,

    /// Idle timeout on connections (e.g. 30s, 500ms). Unset waits forever.
    #[arg(long, global = true, env = "PACKETWIRE_IDLE_TIMEOUT", value_parser = parse_duration)]
    pub idle_timeout: Option<Duration>,
}

impl FramingArgs {
    pub fn transport_opts(&self) -> CliResult<TransportOpts> {
        let opts = TransportOpts::default()
            .with_delimiter(self.delimiter.0.clone())
            .with_max_size(self.max_size)
            .with_encoding(self.encoding)
            .with_timeout(self.idle_timeout)
            .with_multiplexed(!self.no_stream_ids);
        opts.validate()
            .map_err(|err| frame_error("invalid framing options", err))?;
        Ok(opts)
    }
}

/// Raw delimiter bytes after escape processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delimiter(pub Vec<u8>);

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Endpoint to bind (tcp://host:port, ipc:///path, host:port or a path).
    pub endpoint: Endpoint,
}

#[derive(Args, Debug)]
pub struct RequestArgs {
    /// Endpoint to connect to.
    pub endpoint: Endpoint,
    /// Request header as name=value; repeat a name to send a list.
    #[arg(long = "header", short = 'H', value_name = "NAME=VALUE", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,
    /// JSON payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// String payload, encoded with --encoding.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Connect and response timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub timeout: Duration,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Endpoint to bind.
    pub endpoint: Endpoint,
    /// Exit after printing N packets.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::usage("duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::usage(format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::usage("duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

pub fn parse_delimiter(input: &str) -> CliResult<Delimiter> {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.bytes();
    while let Some(byte) = bytes.next() {
        if byte != b'\\' {
            out.push(byte);
            continue;
        }
        match bytes.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(b'\\') => out.push(b'\\'),
            Some(b'x') => {
                let hex = [bytes.next(), bytes.next()];
                let [Some(hi), Some(lo)] = hex else {
                    return Err(CliError::usage(format!("truncated \\x escape in {input:?}")));
                };
                let digits = [hi, lo];
                let text = std::str::from_utf8(&digits)
                    .map_err(|_| CliError::usage(format!("invalid \\x escape in {input:?}")))?;
                let value = u8::from_str_radix(text, 16)
                    .map_err(|_| CliError::usage(format!("invalid \\x escape in {input:?}")))?;
                out.push(value);
            }
            Some(other) => {
                return Err(CliError::usage(format!(
                    "unknown escape \\{} in {input:?}",
                    char::from(other)
                )))
            }
            None => return Err(CliError::usage(format!("trailing backslash in {input:?}"))),
        }
    }
    if out.is_empty() {
        return Err(CliError::usage("delimiter must not be empty"));
    }
    Ok(Delimiter(out))
}

fn parse_encoding(input: &str) -> CliResult<Encoding> {
    input
        .parse()
        .map_err(|err| CliError::usage(format!("{err}")))
}

fn parse_header(input: &str) -> CliResult<(String, String)> {
    let Some((name, value)) = input.split_once('=') else {
        return Err(CliError::usage(format!("header must be NAME=VALUE: {input}")));
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(CliError::usage(format!("header name must not be empty: {input}")));
    }
    Ok((name.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn parse_delimiter_escapes() {
        assert_eq!(parse_delimiter("\\x1e\\r\\n").unwrap().0, b"\x1e\r\n");
        assert_eq!(parse_delimiter("\\n").unwrap().0, b"\n");
        assert_eq!(parse_delimiter("||").unwrap().0, b"||");
        assert!(parse_delimiter("\\x1").is_err());
        assert!(parse_delimiter("\\q").is_err());
        assert!(parse_delimiter("").is_err());
    }

    #[test]
    fn parse_header_splits_on_first_equals() {
        assert_eq!(
            parse_header("x-query=a=b").unwrap(),
            ("x-query".to_string(), "a=b".to_string())
        );
        assert!(parse_header("novalue").is_err());
        assert!(parse_header("=v").is_err());
    }

    #[test]
    fn framing_rejects_tag_like_delimiter() {
        let framing = FramingArgs {
            delimiter: Delimiter(vec![0x01]),
            max_size: DEFAULT_MAX_SIZE,
            encoding: Encoding::Utf8,
            no_stream_ids: false,
            idle_timeout: None,
        };
        let err = framing.transport_opts().expect_err("tag byte delimiter");
        assert_eq!(err.code, crate::exit::USAGE);
    }
}
