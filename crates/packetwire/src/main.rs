mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::{Command, FramingArgs};
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "packetwire", version, about = "Delimiter-framed packet transport CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true, env = "PACKETWIRE_LOG_FORMAT")]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true, env = "PACKETWIRE_LOG_LEVEL")]
    log_level: LogLevel,

    #[command(flatten)]
    framing: FramingArgs,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, &cli.framing, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn parses_request_subcommand() {
        let cli = Cli::try_parse_from([
            "packetwire",
            "request",
            "tcp://127.0.0.1:7000",
            "-H",
            "content-type=json",
            "--data",
            "hello",
            "--timeout",
            "250ms",
        ])
        .expect("request args should parse");

        let Command::Request(args) = cli.command else {
            panic!("expected request command");
        };
        assert_eq!(args.headers.len(), 1);
        assert_eq!(args.timeout, Duration::from_millis(250));
        assert!(cli.framing.transport_opts().expect("defaults").multiplexed);
    }

    #[test]
    fn rejects_conflicting_payload_args() {
        let err = Cli::try_parse_from([
            "packetwire",
            "request",
            "127.0.0.1:7000",
            "--json",
            "{\"x\":1}",
            "--data",
            "hello",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn global_framing_flags_apply_to_subcommands() {
        let cli = Cli::try_parse_from([
            "packetwire",
            "listen",
            "/tmp/pw.sock",
            "--delimiter",
            "\\n",
            "--no-stream-ids",
            "--count",
            "2",
        ])
        .expect("listen args should parse");

        let opts = cli.framing.transport_opts().expect("valid framing");
        assert_eq!(opts.delimiter.as_ref(), b"\n");
        assert!(!opts.multiplexed);
        assert!(matches!(cli.command, Command::Listen(ref args) if args.count == Some(2)));
    }

    #[test]
    fn rejects_malformed_endpoint() {
        let err = Cli::try_parse_from(["packetwire", "serve", "udp://0.0.0.0:1"])
            .expect_err("unsupported scheme");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
