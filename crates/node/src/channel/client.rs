//! # Client Peer Channel
//!
//! Maintains at most one active connection against an ordered list of
//! candidate addresses, with allow-listed peer identity enforcement and
//! transparent failover.
//!
//! ## Failover
//!
//! Dial failures advance round-robin through the candidate list with
//! exponential backoff (floor 1 s, cap 30 s). A successful handshake
//! resets the backoff. After an established connection drops, the dialer
//! retries **the same address first**, so a transient loss re-homes to
//! the current server before wandering to the alternates.
//!
//! ## Outbound Queue
//!
//! `write` posts into a bounded mailbox that doubles as the
//! disconnected-state buffer; queued messages flush FIFO once a
//! connection is up. A full mailbox resolves the handle `Failed`
//! (backpressure) without queueing.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use zoneport_common::LegalName;

use crate::amqp::message::{DeliveryState, MessageHandle, PeerMessage, ReceivedMessage};
use crate::amqp::{Engine, EngineConfig};
use crate::tls::{self, PeerIdentity, TlsError, TlsMaterial};

use super::connection::{run_connection, ConnCommand};
use super::{
    closed_receiver, ChannelError, ChannelEvents, ConnectionChange, SASL_PEER_PASSWORD,
    SASL_PEER_USER,
};

const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Construction-time settings for a client channel.
pub struct ClientSettings {
    /// Candidate servers, tried in order. Must be non-empty.
    pub addresses: Vec<SocketAddr>,
    pub local_legal_name: LegalName,
    /// Peers accepted on handshake; `None` accepts any chain-valid peer.
    pub allow_list: Option<HashSet<LegalName>>,
    pub material: TlsMaterial,
    pub frame_trace: bool,
    /// Bound on the outbound mailbox.
    pub outbound_buffer: usize,
    /// Spawn onto this runtime instead of the ambient one. Stopping the
    /// channel never stops a shared runtime.
    pub runtime: Option<tokio::runtime::Handle>,
}

/// A running client channel.
pub struct PeerChannelClient {
    cmd_tx: mpsc::Sender<ConnCommand>,
    events: Mutex<Option<ChannelEvents>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl PeerChannelClient {
    /// Validate settings and spawn the dialer. Fails fast on an empty
    /// address list or unusable TLS material.
    pub fn start(mut settings: ClientSettings) -> Result<Self, ChannelError> {
        if settings.addresses.is_empty() {
            return Err(ChannelError::NoAddresses);
        }
        let tls_config = Arc::new(tls::client_config(&settings.material)?);
        let (cmd_tx, cmd_rx) = mpsc::channel(settings.outbound_buffer.max(1));
        let events = ChannelEvents::new();
        let cancel = CancellationToken::new();

        let runtime = settings.runtime.take();
        let dialer = run_client(
            settings,
            TlsConnector::from(tls_config),
            cmd_rx,
            events.clone(),
            cancel.clone(),
        );
        let task = match runtime {
            Some(handle) => handle.spawn(dialer),
            None => tokio::spawn(dialer),
        };

        Ok(Self {
            cmd_tx,
            events: Mutex::new(Some(events)),
            cancel,
            task: Mutex::new(Some(task)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Stream of connection lifecycle events; late subscribers see only
    /// future events.
    pub fn on_connection(&self) -> broadcast::Receiver<ConnectionChange> {
        match self.events.lock().as_ref() {
            Some(events) => events.on_connection(),
            None => closed_receiver(),
        }
    }

    /// Stream of inbound application messages.
    pub fn on_receive(&self) -> broadcast::Receiver<ReceivedMessage> {
        match self.events.lock().as_ref() {
            Some(events) => events.on_receive(),
            None => closed_receiver(),
        }
    }

    /// Submit an outbound message. The handle resolves `Acknowledged`,
    /// `Rejected` (disposition or misroute), or `Failed` (backpressure,
    /// disconnect, or stop).
    pub fn write(&self, message: PeerMessage) -> MessageHandle {
        let (completion, handle) = MessageHandle::pair();
        if self.stopped.load(Ordering::SeqCst) {
            let _ = completion.send(DeliveryState::Failed);
            return handle;
        }
        match self.cmd_tx.try_send(ConnCommand::Send {
            message,
            completion,
        }) {
            Ok(()) => handle,
            Err(TrySendError::Full(ConnCommand::Send { completion, .. })) => {
                warn!("outbound queue full, failing message");
                let _ = completion.send(DeliveryState::Failed);
                handle
            }
            Err(TrySendError::Closed(ConnCommand::Send { completion, .. })) => {
                let _ = completion.send(DeliveryState::Failed);
                handle
            }
        }
    }

    /// Stop the channel: cancel reconnection, close the active socket,
    /// fail in-flight handles, and complete the event streams. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.events.lock().take();
    }
}

enum EstablishError {
    /// TCP-level failure: advance through the candidate list quietly.
    Dial(std::io::Error),
    /// Handshake or identity policy failure: the connection attempt is
    /// observable as a `connected=false` event.
    Policy(TlsError),
}

async fn run_client(
    settings: ClientSettings,
    connector: TlsConnector,
    mut cmd_rx: mpsc::Receiver<ConnCommand>,
    events: ChannelEvents,
    cancel: CancellationToken,
) {
    let server_name = match tls::peer_server_name() {
        Ok(name) => name,
        Err(e) => {
            error!(error = %e, "cannot build TLS server name");
            return;
        }
    };

    let addresses = settings.addresses.clone();
    let mut index = 0usize;
    let mut backoff = BACKOFF_FLOOR;

    while !cancel.is_cancelled() {
        let address = addresses[index];
        match establish(
            &connector,
            address,
            &server_name,
            settings.allow_list.as_ref(),
        )
        .await
        {
            Ok((stream, peer)) => {
                backoff = BACKOFF_FLOOR;
                info!(peer = %peer.legal_name, %address, "connected");
                events.emit_connection(ConnectionChange {
                    remote_address: address,
                    remote_cert: Some(peer.cert_der.clone()),
                    remote_legal_name: Some(peer.legal_name.clone()),
                    connected: true,
                });

                let engine = Engine::new(EngineConfig {
                    server_mode: false,
                    container_id: settings.local_legal_name.to_string(),
                    remote_container: peer.legal_name.to_string(),
                    sasl_user: SASL_PEER_USER.to_string(),
                    sasl_password: SASL_PEER_PASSWORD.to_string(),
                    frame_trace: settings.frame_trace,
                    idle_timeout: Some(IDLE_TIMEOUT),
                });
                run_connection(
                    stream,
                    engine,
                    address,
                    peer,
                    events.clone(),
                    Some(&mut cmd_rx),
                    cancel.clone(),
                )
                .await;

                info!(%address, "disconnected");
                events.emit_connection(ConnectionChange {
                    remote_address: address,
                    remote_cert: None,
                    remote_legal_name: None,
                    connected: false,
                });
                // Reconnect starting from the same index, so a transient
                // loss re-homes to the current server first.
            }
            Err(EstablishError::Dial(e)) => {
                debug!(%address, error = %e, "dial failed");
                index = (index + 1) % addresses.len();
                if !sleep_cancellable(&cancel, backoff).await {
                    break;
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
            Err(EstablishError::Policy(e)) => {
                error!(%address, error = %e, "peer refused by identity policy");
                events.emit_connection(ConnectionChange {
                    remote_address: address,
                    remote_cert: None,
                    remote_legal_name: None,
                    connected: false,
                });
                index = (index + 1) % addresses.len();
                if !sleep_cancellable(&cancel, backoff).await {
                    break;
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        }
    }

    // Fail whatever is still queued; nothing will ever send it.
    cmd_rx.close();
    while let Ok(command) = cmd_rx.try_recv() {
        let ConnCommand::Send { completion, .. } = command;
        let _ = completion.send(DeliveryState::Failed);
    }
}

async fn establish(
    connector: &TlsConnector,
    address: SocketAddr,
    server_name: &rustls::pki_types::ServerName<'static>,
    allow_list: Option<&HashSet<LegalName>>,
) -> Result<(tokio_rustls::client::TlsStream<TcpStream>, PeerIdentity), EstablishError> {
    let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
        .await
        .map_err(|_| {
            EstablishError::Dial(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            ))
        })?
        .map_err(EstablishError::Dial)?;
    let _ = tcp.set_nodelay(true);

    let stream = connector
        .connect(server_name.clone(), tcp)
        .await
        .map_err(|e| EstablishError::Policy(TlsError::PeerChainUntrusted(e.to_string())))?;

    let peer = tls::authorise_peer(stream.get_ref().1.peer_certificates(), allow_list)
        .map_err(EstablishError::Policy)?;
    Ok((stream, peer))
}

/// Returns false when cancellation fired during the sleep.
async fn sleep_cancellable(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
