use packetwire_frame::{Packet, PacketEvent, TransportOpts};
use packetwire_session::{ServerBuilder, TransportSession};
use packetwire_transport::ListenOpts;
use tokio::task::JoinSet;

use crate::cmd::ServeArgs;
use crate::exit::{session_error, CliResult, SUCCESS};

pub async fn run(args: ServeArgs, opts: TransportOpts) -> CliResult<i32> {
    let mut listener = ServerBuilder::new(ListenOpts::new(args.endpoint), opts)
        .bind()
        .await
        .map_err(|err| session_error("bind failed", err))?;

    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Some(Ok(session)) => {
                    sessions.spawn(echo(session));
                }
                Some(Err(err)) => return Err(session_error("accept failed", err)),
                None => break,
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    listener.close();
    sessions.shutdown().await;
    Ok(SUCCESS)
}

/// Echo every packet back on its own stream id until the peer hangs up.
async fn echo(session: TransportSession) {
    let mut inbound = session.receive(None);
    while let Some(event) = inbound.recv().await {
        let event = match event {
            Ok(event) => event,
            Err(_) => break,
        };
        let Some(reply) = echo_reply(event) else {
            continue;
        };

        tracing::info!(
            peer = %session.peer(),
            id = ?reply.id,
            size = reply.payload_len(),
            "echoing packet"
        );
        if let Err(err) = session.send(&reply).await {
            tracing::warn!(peer = %session.peer(), error = %err, "echo send failed");
            break;
        }
    }
    session.destroy().await;
}

/// The packet to send back for `event`, if any.
///
/// Header frames are answered together with the payload (or end marker)
/// that follows them.
fn echo_reply(event: PacketEvent) -> Option<Packet> {
    match event {
        PacketEvent::Head(_) => None,
        PacketEvent::Body(packet) | PacketEvent::End(packet) => Some(packet),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heads_are_not_echoed_on_their_own() {
        let head = PacketEvent::Head(Packet::new().with_id(1u16).with_header("a", "b"));
        assert!(echo_reply(head).is_none());

        let body = Packet::new()
            .with_id(1u16)
            .with_header("a", "b")
            .with_payload(&b"x"[..]);
        assert_eq!(echo_reply(PacketEvent::Body(body.clone())), Some(body));

        let end = Packet::new().with_id(2u16);
        assert_eq!(echo_reply(PacketEvent::End(end.clone())), Some(end));
    }
}
