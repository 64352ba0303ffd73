//! The per-connection task: owns one engine, one TLS stream, and all
//! serialisation between them.
//!
//! Everything that touches the engine for a given connection happens on
//! this task, so the engine stays single-threaded from its own point of
//! view. Application writers post commands into the task's mailbox;
//! receiver-side completions come back over a dedicated channel.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::amqp::message::{encode_message, Completion, DeliveryState, PeerMessage, ReceivedMessage};
use crate::amqp::{Engine, EngineEvent};
use crate::tls::PeerIdentity;

use super::ChannelEvents;

/// Commands posted to a connection task by application threads.
pub(crate) enum ConnCommand {
    Send {
        message: PeerMessage,
        completion: oneshot::Sender<DeliveryState>,
    },
}

const READ_BUF_SIZE: usize = 16 * 1024;

/// Drive one established connection until the peer closes, an error
/// occurs, or cancellation fires. Returns when the engine is closed and
/// all in-flight handles are resolved.
pub(crate) async fn run_connection<S>(
    stream: S,
    mut engine: Engine,
    remote_address: SocketAddr,
    peer: PeerIdentity,
    events: ChannelEvents,
    mut commands: Option<&mut mpsc::Receiver<ConnCommand>>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<(u32, bool)>();
    let mut read_buf = vec![0u8; READ_BUF_SIZE];
    let mut peer_closed = false;

    loop {
        // Flush whatever the engine wants on the wire before waiting.
        let outbound = engine.drain_outbound();
        if !outbound.is_empty() && writer.write_all(&outbound).await.is_err() {
            break;
        }

        while let Some(event) = engine.poll_event() {
            match event {
                EngineEvent::Ready => {
                    debug!(peer = %peer.legal_name, %remote_address, "peer link established");
                }
                EngineEvent::Received {
                    delivery_id,
                    message,
                } => {
                    events.emit_receive(ReceivedMessage::new(
                        message.payload,
                        message.topic,
                        peer.legal_name.clone(),
                        message.application_properties,
                        Completion::new(delivery_id, completion_tx.clone()),
                    ));
                }
                EngineEvent::Closed { error } => {
                    if let Some(error) = error {
                        warn!(peer = %peer.legal_name, %remote_address, error = %error, "connection failed");
                    }
                    peer_closed = true;
                }
            }
        }
        if peer_closed || engine.is_closed() {
            break;
        }

        let deadline = engine.tick(Instant::now());
        tokio::select! {
            _ = cancel.cancelled() => {
                engine.close();
                let final_bytes = engine.drain_outbound();
                if !final_bytes.is_empty() {
                    let _ = writer.write_all(&final_bytes).await;
                }
                break;
            }
            read = reader.read(&mut read_buf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => engine.feed_inbound(&read_buf[..n]),
                    Err(e) => {
                        debug!(%remote_address, error = %e, "socket read failed");
                        break;
                    }
                }
            }
            completed = completion_rx.recv() => {
                if let Some((delivery_id, accepted)) = completed {
                    engine.complete(delivery_id, accepted);
                }
            }
            command = recv_command(&mut commands) => {
                match command {
                    Some(ConnCommand::Send { message, completion }) => {
                        submit(&mut engine, remote_address, &peer, message, completion);
                    }
                    // All submitters dropped; the channel is going away.
                    None => break,
                }
            }
            _ = tick_sleep(deadline) => {}
        }
    }

    // Resolve anything still in flight.
    engine.close();
}

/// Validate routing, then hand the message to the engine.
fn submit(
    engine: &mut Engine,
    remote_address: SocketAddr,
    peer: &PeerIdentity,
    message: PeerMessage,
    completion: oneshot::Sender<DeliveryState>,
) {
    if message.destination_address != remote_address
        || message.destination_legal_name != peer.legal_name
    {
        warn!(
            destination = %message.destination_legal_name,
            connected_to = %peer.legal_name,
            "message misrouted, rejecting without sending"
        );
        let _ = completion.send(DeliveryState::Rejected);
        return;
    }
    let encoded = encode_message(
        &message.topic,
        &message.application_properties,
        &message.payload,
    );
    engine.enqueue_send(encoded, completion);
}

async fn recv_command(
    commands: &mut Option<&mut mpsc::Receiver<ConnCommand>>,
) -> Option<ConnCommand> {
    match commands {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
