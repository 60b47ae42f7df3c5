use packetwire_frame::{Packet, PacketEvent, TransportOpts};
use packetwire_session::{ServerBuilder, TransportSession};
use packetwire_transport::ListenOpts;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::cmd::ListenArgs;
use crate::exit::{session_error, CliResult, SUCCESS};
use crate::output::{print_packet, OutputFormat};

const PRINT_QUEUE: usize = 64;

pub async fn run(args: ListenArgs, opts: TransportOpts, format: OutputFormat) -> CliResult<i32> {
    let encoding = opts.encoding;
    let mut listener = ServerBuilder::new(ListenOpts::new(args.endpoint), opts)
        .bind()
        .await
        .map_err(|err| session_error("bind failed", err))?;

    let (tx, mut rx) = mpsc::channel::<(String, Packet)>(PRINT_QUEUE);
    let mut sessions = JoinSet::new();
    let mut printed = 0usize;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            accepted = listener.accept() => match accepted {
                Some(Ok(session)) => {
                    tracing::debug!(peer = %session.peer(), "peer connected");
                    sessions.spawn(forward(session, tx.clone()));
                }
                Some(Err(err)) => return Err(session_error("accept failed", err)),
                None => break,
            },
            Some((peer, packet)) = rx.recv() => {
                print_packet(&packet, &peer, encoding, format);
                printed = printed.saturating_add(1);
                if args.count.is_some_and(|count| printed >= count) {
                    break;
                }
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    listener.close();
    sessions.shutdown().await;
    Ok(SUCCESS)
}

/// Queue every complete packet from `session` for printing.
async fn forward(session: TransportSession, tx: mpsc::Sender<(String, Packet)>) {
    let peer = session.peer().to_string();
    let mut inbound = session.receive(None);
    while let Some(Ok(event)) = inbound.recv().await {
        if let PacketEvent::Head(_) = event {
            continue;
        }
        if tx.send((peer.clone(), event.into_packet())).await.is_err() {
            break;
        }
    }
    tracing::debug!(%peer, "peer disconnected");
}
