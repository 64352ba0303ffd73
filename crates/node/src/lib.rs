//! # Zoneport Node Crate
//!
//! The mutually-authenticated AMQP 1.0 peer transport for a permissioned
//! compatibility zone: one-shot node enrolment against the doorman, and
//! the long-lived TLS peer channel.
//!
//! ## Modules
//! - `credential_store`: password-protected keystore/truststore files
//! - `x509`: keypairs, certificates, CSRs, chain validation
//! - `doorman_client` / `registration`: the enrolment flow
//! - `amqp`: the sans-io AMQP 1.0 engine and message model
//! - `tls`: rustls configuration and peer identity policy
//! - `channel`: client and server peer channels
//!
//! ## Enrolment then transport
//!
//! ```text
//! ┌────────────┐   CSR / poll / zip    ┌─────────┐
//! │Registration│ ────────────────────► │ doorman │
//! └─────┬──────┘                       └─────────┘
//!       │ installs nodekeystore.jks + sslkeystore.jks
//!       ▼
//! ┌────────────┐  mutual TLS + AMQP   ┌────────────┐
//! │PeerChannel │ ◄──────────────────► │ peer node  │
//! └────────────┘                      └────────────┘
//! ```

pub mod amqp;
pub mod channel;
pub mod credential_store;
pub mod doorman_client;
pub mod registration;
pub mod tls;
pub mod x509;

pub use amqp::{DeliveryState, MessageHandle, PeerMessage, PropertyValue, ReceivedMessage};
pub use channel::{
    ChannelError, ClientSettings, ConnectionChange, PeerChannelClient, PeerChannelServer,
    ServerSettings,
};
pub use credential_store::{CredentialStore, StoreError};
pub use doorman_client::{DoormanClient, DoormanError};
pub use registration::{RegistrationError, RegistrationHandler};
pub use tls::{TlsError, TlsMaterial};
pub use x509::{X509Error, ZoneKeyPair};
