use std::fs;
use std::time::Duration;

use packetwire_frame::{Headers, Packet, PacketEvent, TransportOpts};
use packetwire_session::{ClientBuilder, RequestCorrelator, SessionError, TransportSession};
use packetwire_transport::ConnectOpts;
use tokio_util::sync::CancellationToken;

use crate::cmd::RequestArgs;
use crate::exit::{frame_error, io_error, session_error, CliError, CliResult, SUCCESS};
use crate::output::{print_packet, OutputFormat};

pub async fn run(args: RequestArgs, opts: TransportOpts, format: OutputFormat) -> CliResult<i32> {
    let packet = build_packet(&args, &opts)?;
    let encoding = opts.encoding;
    let multiplexed = opts.multiplexed;

    let cancel = CancellationToken::new();
    let builder = ClientBuilder::new(
        ConnectOpts::new(args.endpoint.clone()).with_connect_timeout(args.timeout),
        opts,
    );

    let response = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            return Err(session_error("request interrupted", SessionError::Cancelled));
        }
        response = exchange(&builder, &cancel, packet, args.timeout, multiplexed) => response,
    };
    let (peer, response) = response?;
    print_packet(&response, &peer, encoding, format);
    Ok(SUCCESS)
}

async fn exchange(
    builder: &ClientBuilder,
    cancel: &CancellationToken,
    packet: Packet,
    timeout: Duration,
    multiplexed: bool,
) -> CliResult<(String, Packet)> {
    let session = builder
        .connect(cancel)
        .await
        .map_err(|err| session_error("connect failed", err))?;
    let peer = session.peer().to_string();

    let response = if multiplexed {
        correlated(&session, packet, timeout).await
    } else {
        first_response(&session, &packet, timeout).await
    };
    session.destroy().await;

    let response = response.map_err(|err| session_error("request failed", err))?;
    Ok((peer, response))
}

async fn correlated(
    session: &TransportSession,
    packet: Packet,
    timeout: Duration,
) -> Result<Packet, SessionError> {
    let correlator = RequestCorrelator::new(session.clone())?;
    correlator.request_with_timeout(packet, Some(timeout)).await
}

/// Without stream ids the only possible correlation is "next packet back".
async fn first_response(
    session: &TransportSession,
    packet: &Packet,
    timeout: Duration,
) -> Result<Packet, SessionError> {
    let mut inbound = session.receive(None);
    session.send(packet).await?;

    let wait = async {
        loop {
            match inbound.recv().await {
                Some(Ok(PacketEvent::Head(_))) => continue,
                Some(Ok(event)) => return Ok(event.into_packet()),
                Some(Err(err)) => return Err(err),
                None => return Err(SessionError::ConnectionClosed),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| SessionError::RequestTimeout(timeout))?
}

fn build_packet(args: &RequestArgs, opts: &TransportOpts) -> CliResult<Packet> {
    let headers: Headers = args
        .headers
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect();
    let packet = Packet::new().with_headers(headers);

    if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::usage(format!("--json is not valid JSON: {err}")))?;
        return Ok(packet.with_payload(json.as_bytes().to_vec()));
    }
    if let Some(data) = &args.data {
        return packet
            .with_text(data, opts.encoding)
            .map_err(|err| frame_error("--data cannot be encoded", err));
    }
    if let Some(path) = &args.file {
        let bytes = fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
        return Ok(packet.with_payload(bytes));
    }
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use packetwire_frame::Encoding;
    use packetwire_transport::Endpoint;

    use super::*;

    fn args() -> RequestArgs {
        RequestArgs {
            endpoint: Endpoint::tcp("127.0.0.1:1"),
            headers: vec![
                ("accept".to_string(), "json".to_string()),
                ("tag".to_string(), "a".to_string()),
                ("Tag".to_string(), "b".to_string()),
            ],
            json: None,
            data: None,
            file: None,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn repeated_headers_become_lists() {
        let packet = build_packet(&args(), &TransportOpts::default()).expect("packet");
        assert_eq!(packet.headers.get_str("accept"), Some("json"));
        assert_eq!(
            packet.headers.get("tag").and_then(|v| v.as_list()),
            Some(&["a".to_string(), "b".to_string()][..])
        );
        assert!(packet.payload.is_none());
    }

    #[test]
    fn data_uses_configured_encoding() {
        let mut args = args();
        args.data = Some("é".to_string());
        let opts = TransportOpts::default().with_encoding(Encoding::Latin1);
        let packet = build_packet(&args, &opts).expect("packet");
        assert_eq!(packet.payload.as_deref(), Some(&[0xE9][..]));
    }

    #[test]
    fn invalid_json_is_a_usage_error() {
        let mut args = args();
        args.json = Some("{nope".to_string());
        let err = build_packet(&args, &TransportOpts::default()).expect_err("bad json");
        assert_eq!(err.code, crate::exit::USAGE);
    }
}
