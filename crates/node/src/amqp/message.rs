//! Application messages and their delivery lifecycle.
//!
//! A [`PeerMessage`] is what callers hand to the channel; on the wire it
//! becomes an AMQP bare message of three sections: properties (carrying
//! the topic as subject), application-properties, and a single data
//! section holding the payload. Delivery progress is observed through a
//! [`MessageHandle`], a one-shot future resolving to a terminal
//! [`DeliveryState`].

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};

use zoneport_common::LegalName;

use super::codec::{decode_value, encode_value, CodecError, Value};

const DESC_PROPERTIES: u64 = 0x73;
const DESC_APPLICATION_PROPERTIES: u64 = 0x74;
const DESC_DATA: u64 = 0x75;

/// Scalar values allowed in application properties.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Str(String),
    Long(i64),
    Bool(bool),
}

impl PropertyValue {
    fn to_value(&self) -> Value {
        match self {
            PropertyValue::Str(s) => Value::Str(s.clone()),
            PropertyValue::Long(v) => Value::Long(*v),
            PropertyValue::Bool(b) => Value::Bool(*b),
        }
    }

    fn from_value(value: &Value) -> Option<PropertyValue> {
        match value {
            Value::Str(s) | Value::Symbol(s) => Some(PropertyValue::Str(s.clone())),
            Value::Long(v) => Some(PropertyValue::Long(*v)),
            Value::Int(v) => Some(PropertyValue::Long(i64::from(*v))),
            Value::Uint(v) => Some(PropertyValue::Long(i64::from(*v))),
            Value::Ulong(v) => i64::try_from(*v).ok().map(PropertyValue::Long),
            Value::Bool(b) => Some(PropertyValue::Bool(*b)),
            _ => None,
        }
    }
}

/// Lifecycle of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Accepted by the channel, not yet handed to the engine.
    PreQueued,
    /// On the wire, awaiting the peer's disposition.
    Sent,
    /// The peer accepted the delivery.
    Acknowledged,
    /// The peer rejected or released the delivery, or it was misrouted.
    Rejected,
    /// The connection died or the channel refused the message.
    Failed,
}

impl DeliveryState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryState::Acknowledged | DeliveryState::Rejected | DeliveryState::Failed
        )
    }
}

/// An outbound application message.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerMessage {
    pub payload: Bytes,
    pub topic: String,
    pub destination_legal_name: LegalName,
    pub destination_address: SocketAddr,
    pub application_properties: BTreeMap<String, PropertyValue>,
}

/// Completion side of an outbound message; resolves once the delivery
/// reaches a terminal state.
#[derive(Debug)]
pub struct MessageHandle {
    rx: oneshot::Receiver<DeliveryState>,
}

impl MessageHandle {
    /// Creates a handle and its resolving half.
    pub fn pair() -> (oneshot::Sender<DeliveryState>, MessageHandle) {
        let (tx, rx) = oneshot::channel();
        (tx, MessageHandle { rx })
    }

    /// Creates a handle that is already terminal.
    pub fn resolved(state: DeliveryState) -> MessageHandle {
        let (tx, handle) = Self::pair();
        let _ = tx.send(state);
        handle
    }

    /// Waits for the terminal state. A dropped sender counts as `Failed`.
    pub async fn on_complete(self) -> DeliveryState {
        self.rx.await.unwrap_or(DeliveryState::Failed)
    }
}

/// An inbound application message as surfaced on `on_receive`.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub payload: Bytes,
    pub topic: String,
    /// Identity proven by the peer's TLS certificate, stamped by the channel.
    pub source_legal_name: LegalName,
    pub application_properties: BTreeMap<String, PropertyValue>,
    completion: Completion,
}

impl ReceivedMessage {
    pub fn new(
        payload: Bytes,
        topic: String,
        source_legal_name: LegalName,
        application_properties: BTreeMap<String, PropertyValue>,
        completion: Completion,
    ) -> Self {
        Self {
            payload,
            topic,
            source_legal_name,
            application_properties,
            completion,
        }
    }

    /// Accept or reject the delivery. The first call wins; the matching
    /// disposition goes out on the owning connection. Completing also
    /// returns the delivery's receiver credit.
    pub fn complete(&self, accepted: bool) {
        self.completion.complete(accepted);
    }
}

/// Routes a receiver-side accept/reject decision back to the connection
/// task that owns the engine. Cloneable so broadcast subscribers can share
/// a message; only the first completion is delivered.
#[derive(Debug, Clone)]
pub struct Completion {
    delivery_id: u32,
    tx: mpsc::UnboundedSender<(u32, bool)>,
    done: Arc<AtomicBool>,
}

impl Completion {
    pub fn new(delivery_id: u32, tx: mpsc::UnboundedSender<(u32, bool)>) -> Self {
        Self {
            delivery_id,
            tx,
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    fn complete(&self, accepted: bool) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send((self.delivery_id, accepted));
    }
}

/// The decoded sections of an inbound bare message.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub topic: String,
    pub application_properties: BTreeMap<String, PropertyValue>,
    pub payload: Bytes,
}

/// Encode topic, application properties, and payload as a bare message.
pub fn encode_message(
    topic: &str,
    application_properties: &BTreeMap<String, PropertyValue>,
    payload: &[u8],
) -> Bytes {
    let mut buf = BytesMut::new();
    // properties: message-id, user-id, to, subject
    encode_value(
        &Value::described(
            DESC_PROPERTIES,
            Value::List(vec![
                Value::Null,
                Value::Null,
                Value::Null,
                Value::Str(topic.to_string()),
            ]),
        ),
        &mut buf,
    );
    if !application_properties.is_empty() {
        let pairs = application_properties
            .iter()
            .map(|(k, v)| (Value::Str(k.clone()), v.to_value()))
            .collect();
        encode_value(
            &Value::described(DESC_APPLICATION_PROPERTIES, Value::Map(pairs)),
            &mut buf,
        );
    }
    encode_value(
        &Value::described(DESC_DATA, Value::Binary(payload.to_vec())),
        &mut buf,
    );
    buf.freeze()
}

/// Decode a bare message back into its sections.
pub fn decode_message(mut body: &[u8]) -> Result<DecodedMessage, CodecError> {
    let mut topic = String::new();
    let mut application_properties = BTreeMap::new();
    let mut payload = Bytes::new();

    while !body.is_empty() {
        let (value, used) = decode_value(body)?;
        body = &body[used..];
        let (descriptor, section) = match value {
            Value::Described(descriptor, section) => match descriptor.as_u64() {
                Some(d) => (d, *section),
                None => continue,
            },
            // Tolerate unexpected bare values between sections.
            _ => continue,
        };
        match descriptor {
            DESC_PROPERTIES => {
                if let Value::List(fields) = section {
                    if let Some(subject) = fields.get(3).and_then(|v| v.as_str()) {
                        topic = subject.to_string();
                    }
                }
            }
            DESC_APPLICATION_PROPERTIES => {
                if let Value::Map(pairs) = section {
                    for (k, v) in pairs {
                        if let (Some(key), Some(value)) =
                            (k.as_str(), PropertyValue::from_value(&v))
                        {
                            application_properties.insert(key.to_string(), value);
                        }
                    }
                }
            }
            DESC_DATA => {
                if let Value::Binary(data) = section {
                    payload = Bytes::from(data);
                }
            }
            _ => {}
        }
    }

    Ok(DecodedMessage {
        topic,
        application_properties,
        payload,
    })
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryState::PreQueued => "pre-queued",
            DeliveryState::Sent => "sent",
            DeliveryState::Acknowledged => "acknowledged",
            DeliveryState::Rejected => "rejected",
            DeliveryState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trip() {
        let mut props = BTreeMap::new();
        props.insert("retries".to_string(), PropertyValue::Long(3));
        props.insert("urgent".to_string(), PropertyValue::Bool(true));
        props.insert(
            "trace-id".to_string(),
            PropertyValue::Str("abc-123".to_string()),
        );
        let encoded = encode_message("p2p.inbound", &props, b"Test");
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded.topic, "p2p.inbound");
        assert_eq!(decoded.application_properties, props);
        assert_eq!(decoded.payload, Bytes::from_static(b"Test"));
    }

    #[test]
    fn test_message_without_properties() {
        let encoded = encode_message("topic", &BTreeMap::new(), b"");
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded.topic, "topic");
        assert!(decoded.application_properties.is_empty());
        assert!(decoded.payload.is_empty());
    }

    #[tokio::test]
    async fn test_handle_resolves_once() {
        let (tx, handle) = MessageHandle::pair();
        tx.send(DeliveryState::Acknowledged).unwrap();
        assert_eq!(handle.on_complete().await, DeliveryState::Acknowledged);
    }

    #[tokio::test]
    async fn test_dropped_sender_means_failed() {
        let (tx, handle) = MessageHandle::pair();
        drop(tx);
        assert_eq!(handle.on_complete().await, DeliveryState::Failed);
    }

    #[test]
    fn test_completion_first_call_wins() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let completion = Completion::new(5, tx);
        let clone = completion.clone();
        clone.complete(true);
        completion.complete(false);
        assert_eq!(rx.try_recv().unwrap(), (5, true));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(DeliveryState::Acknowledged.is_terminal());
        assert!(DeliveryState::Rejected.is_terminal());
        assert!(DeliveryState::Failed.is_terminal());
        assert!(!DeliveryState::PreQueued.is_terminal());
        assert!(!DeliveryState::Sent.is_terminal());
    }
}
