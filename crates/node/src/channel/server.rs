//! # Server Peer Channel
//!
//! Binds a listening socket, accepts inbound peers, and runs the
//! TLS+identity+engine stack per connection. Inbound messages surface on
//! `on_receive`; establish/teardown on `on_connection`. A graceful stop
//! closes every active connection (emitting its `connected=false`) and
//! ends the accept loop without touching a shared runtime.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use zoneport_common::LegalName;

use crate::amqp::message::ReceivedMessage;
use crate::amqp::{Engine, EngineConfig};
use crate::tls::{self, TlsMaterial};

use super::connection::run_connection;
use super::{
    closed_receiver, ChannelError, ChannelEvents, ConnectionChange, SASL_PEER_PASSWORD,
    SASL_PEER_USER,
};

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Construction-time settings for a server channel.
pub struct ServerSettings {
    pub bind_address: SocketAddr,
    pub local_legal_name: LegalName,
    /// Peers accepted on handshake; `None` accepts any chain-valid peer.
    pub allow_list: Option<HashSet<LegalName>>,
    pub material: TlsMaterial,
    pub frame_trace: bool,
    /// Spawn onto this runtime instead of the ambient one.
    pub runtime: Option<tokio::runtime::Handle>,
}

/// A running server channel.
pub struct PeerChannelServer {
    local_address: SocketAddr,
    events: Mutex<Option<ChannelEvents>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl PeerChannelServer {
    /// Bind and start accepting.
    pub async fn start(mut settings: ServerSettings) -> Result<Self, ChannelError> {
        let acceptor = TlsAcceptor::from(Arc::new(tls::server_config(&settings.material)?));
        let listener = TcpListener::bind(settings.bind_address).await?;
        let local_address = listener.local_addr()?;
        info!(%local_address, name = %settings.local_legal_name, "peer server listening");

        let events = ChannelEvents::new();
        let cancel = CancellationToken::new();
        let runtime = settings.runtime.take();
        let loop_future = accept_loop(
            listener,
            acceptor,
            settings.local_legal_name,
            settings.allow_list,
            settings.frame_trace,
            events.clone(),
            cancel.clone(),
        );
        let task = match runtime {
            Some(handle) => handle.spawn(loop_future),
            None => tokio::spawn(loop_future),
        };

        Ok(Self {
            local_address,
            events: Mutex::new(Some(events)),
            cancel,
            task: Mutex::new(Some(task)),
            stopped: AtomicBool::new(false),
        })
    }

    /// The bound address; useful when binding port 0.
    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    /// Stream of connection lifecycle events.
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

    /// Graceful stop: terminate the accept loop, close active
    /// connections, and complete the event streams. Idempotent.
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

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    local_legal_name: LegalName,
    allow_list: Option<HashSet<LegalName>>,
    frame_trace: bool,
    events: ChannelEvents,
    cancel: CancellationToken,
) {
    let allow_list = Arc::new(allow_list);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((tcp, remote_address)) => {
                        connections.spawn(handle_inbound(
                            tcp,
                            remote_address,
                            acceptor.clone(),
                            local_legal_name.clone(),
                            allow_list.clone(),
                            frame_trace,
                            events.clone(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    // Connection tasks observe the cancelled token and close cleanly.
    while connections.join_next().await.is_some() {}
}

#[allow(clippy::too_many_arguments)]
async fn handle_inbound(
    tcp: TcpStream,
    remote_address: SocketAddr,
    acceptor: TlsAcceptor,
    local_legal_name: LegalName,
    allow_list: Arc<Option<HashSet<LegalName>>>,
    frame_trace: bool,
    events: ChannelEvents,
    cancel: CancellationToken,
) {
    let _ = tcp.set_nodelay(true);
    let stream = match acceptor.accept(tcp).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(%remote_address, error = %e, "TLS handshake failed");
            events.emit_connection(ConnectionChange {
                remote_address,
                remote_cert: None,
                remote_legal_name: None,
                connected: false,
            });
            return;
        }
    };

    let peer = match tls::authorise_peer(
        stream.get_ref().1.peer_certificates(),
        allow_list.as_ref().as_ref(),
    ) {
        Ok(peer) => peer,
        Err(e) => {
            error!(%remote_address, error = %e, "peer refused by identity policy");
            events.emit_connection(ConnectionChange {
                remote_address,
                remote_cert: None,
                remote_legal_name: None,
                connected: false,
            });
            return;
        }
    };

    info!(peer = %peer.legal_name, %remote_address, "peer connected");
    events.emit_connection(ConnectionChange {
        remote_address,
        remote_cert: Some(peer.cert_der.clone()),
        remote_legal_name: Some(peer.legal_name.clone()),
        connected: true,
    });

    let engine = Engine::new(EngineConfig {
        server_mode: true,
        container_id: local_legal_name.to_string(),
        remote_container: peer.legal_name.to_string(),
        sasl_user: SASL_PEER_USER.to_string(),
        sasl_password: SASL_PEER_PASSWORD.to_string(),
        frame_trace,
        idle_timeout: Some(IDLE_TIMEOUT),
    });
    run_connection(
        stream,
        engine,
        remote_address,
        peer,
        events.clone(),
        None,
        cancel,
    )
    .await;

    info!(%remote_address, "peer disconnected");
    events.emit_connection(ConnectionChange {
        remote_address,
        remote_cert: None,
        remote_legal_name: None,
        connected: false,
    });
}
