//! # Peer Channel
//!
//! Client and server flavours of the TLS+AMQP peer channel, sharing the
//! engine and identity-handler stack. Connection and message events are
//! multi-consumer broadcast streams: late subscribers see only future
//! events; per-message completion is a one-shot future on the
//! [`MessageHandle`](crate::amqp::MessageHandle).

mod connection;

pub mod client;
pub mod server;

pub use client::{ClientSettings, PeerChannelClient};
pub use server::{PeerChannelServer, ServerSettings};

use std::net::SocketAddr;

use thiserror::Error;
use tokio::sync::broadcast;

use zoneport_common::LegalName;

use crate::amqp::ReceivedMessage;
use crate::tls::TlsError;

/// SASL identity every zone peer presents inside the TLS tunnel.
pub(crate) const SASL_PEER_USER: &str = "zone-peer";
pub(crate) const SASL_PEER_PASSWORD: &str = "zone-peer";

/// Capacity of the broadcast event streams.
const EVENT_STREAM_CAPACITY: usize = 256;

/// Error type for channel construction and submission.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("client needs at least one candidate address")]
    NoAddresses,
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("channel I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("channel already stopped")]
    Stopped,
}

/// Connection lifecycle event, emitted on every establish and teardown.
#[derive(Debug, Clone)]
pub struct ConnectionChange {
    pub remote_address: SocketAddr,
    /// Present exactly when `connected` is true.
    pub remote_cert: Option<Vec<u8>>,
    pub remote_legal_name: Option<LegalName>,
    pub connected: bool,
}

/// The channel's broadcast event streams.
#[derive(Debug, Clone)]
pub(crate) struct ChannelEvents {
    connection_tx: broadcast::Sender<ConnectionChange>,
    receive_tx: broadcast::Sender<ReceivedMessage>,
}

impl ChannelEvents {
    pub(crate) fn new() -> Self {
        let (connection_tx, _) = broadcast::channel(EVENT_STREAM_CAPACITY);
        let (receive_tx, _) = broadcast::channel(EVENT_STREAM_CAPACITY);
        Self {
            connection_tx,
            receive_tx,
        }
    }

    pub(crate) fn on_connection(&self) -> broadcast::Receiver<ConnectionChange> {
        self.connection_tx.subscribe()
    }

    pub(crate) fn on_receive(&self) -> broadcast::Receiver<ReceivedMessage> {
        self.receive_tx.subscribe()
    }

    pub(crate) fn emit_connection(&self, change: ConnectionChange) {
        // A send error only means nobody is subscribed right now.
        let _ = self.connection_tx.send(change);
    }

    pub(crate) fn emit_receive(&self, message: ReceivedMessage) {
        let _ = self.receive_tx.send(message);
    }
}

/// A receiver pair for a channel that has already completed its streams.
pub(crate) fn closed_receiver<T: Clone>() -> broadcast::Receiver<T> {
    let (tx, rx) = broadcast::channel(1);
    drop(tx);
    rx
}
