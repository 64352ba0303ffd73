//! AMQP 1.0 protocol engine for peer messaging.
//!
//! Only the subset required for one peer connection: a single session,
//! one sender and one receiver link, unsettled deliveries with explicit
//! dispositions.

pub mod codec;
pub mod engine;
pub mod framing;
pub mod message;
pub mod performative;

pub use engine::{Engine, EngineConfig, EngineEvent};
pub use message::{
    Completion, DeliveryState, MessageHandle, PeerMessage, PropertyValue, ReceivedMessage,
};
