//! AMQP 1.0 performatives and SASL frames.
//!
//! Typed encode/decode for the performative subset the peer transport
//! uses: connection and session setup, one sender and one receiver link,
//! transfers with explicit dispositions, and the PLAIN SASL exchange.
//! Every performative is a described list; unknown trailing fields are
//! tolerated on decode, absent fields take their protocol defaults.

use bytes::{Bytes, BytesMut};

use super::codec::{decode_value, encode_value, CodecError, Value};

pub const DESC_OPEN: u64 = 0x10;
pub const DESC_BEGIN: u64 = 0x11;
pub const DESC_ATTACH: u64 = 0x12;
pub const DESC_FLOW: u64 = 0x13;
pub const DESC_TRANSFER: u64 = 0x14;
pub const DESC_DISPOSITION: u64 = 0x15;
pub const DESC_DETACH: u64 = 0x16;
pub const DESC_END: u64 = 0x17;
pub const DESC_CLOSE: u64 = 0x18;
pub const DESC_ERROR: u64 = 0x1d;
pub const DESC_ACCEPTED: u64 = 0x24;
pub const DESC_REJECTED: u64 = 0x25;
pub const DESC_RELEASED: u64 = 0x26;
pub const DESC_SASL_MECHANISMS: u64 = 0x40;
pub const DESC_SASL_INIT: u64 = 0x41;
pub const DESC_SASL_OUTCOME: u64 = 0x44;

/// SASL outcome code for success.
pub const SASL_CODE_OK: u8 = 0;
/// SASL outcome code for authentication failure.
pub const SASL_CODE_AUTH: u8 = 1;

/// Terminal delivery outcome carried in a disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Rejected,
    Released,
}

/// The error element of a close or detach performative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpError {
    pub condition: String,
    pub description: Option<String>,
}

/// The performative subset spoken by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Performative {
    Open {
        container_id: String,
        /// Our idle timeout in milliseconds; the peer heartbeats within it.
        idle_timeout_ms: Option<u32>,
    },
    Begin {
        next_outgoing_id: u32,
        incoming_window: u32,
        outgoing_window: u32,
    },
    Attach {
        name: String,
        handle: u32,
        /// true when this endpoint is the receiver on the link.
        receiver: bool,
    },
    Flow {
        next_incoming_id: Option<u32>,
        incoming_window: u32,
        next_outgoing_id: u32,
        outgoing_window: u32,
        handle: Option<u32>,
        delivery_count: Option<u32>,
        link_credit: Option<u32>,
    },
    Transfer {
        handle: u32,
        delivery_id: Option<u32>,
        delivery_tag: Vec<u8>,
        settled: bool,
        more: bool,
    },
    Disposition {
        receiver: bool,
        first: u32,
        last: Option<u32>,
        settled: bool,
        outcome: Option<Outcome>,
    },
    Detach {
        handle: u32,
        closed: bool,
    },
    End,
    Close {
        error: Option<AmqpError>,
    },
    SaslMechanisms {
        mechanisms: Vec<String>,
    },
    SaslInit {
        mechanism: String,
        initial_response: Vec<u8>,
    },
    SaslOutcome {
        code: u8,
    },
}

impl Performative {
    /// Short name for frame tracing.
    pub fn name(&self) -> &'static str {
        match self {
            Performative::Open { .. } => "open",
            Performative::Begin { .. } => "begin",
            Performative::Attach { .. } => "attach",
            Performative::Flow { .. } => "flow",
            Performative::Transfer { .. } => "transfer",
            Performative::Disposition { .. } => "disposition",
            Performative::Detach { .. } => "detach",
            Performative::End => "end",
            Performative::Close { .. } => "close",
            Performative::SaslMechanisms { .. } => "sasl-mechanisms",
            Performative::SaslInit { .. } => "sasl-init",
            Performative::SaslOutcome { .. } => "sasl-outcome",
        }
    }
}

fn opt_uint(v: Option<u32>) -> Value {
    match v {
        Some(v) => Value::Uint(v),
        None => Value::Null,
    }
}

fn outcome_value(outcome: Outcome) -> Value {
    let descriptor = match outcome {
        Outcome::Accepted => DESC_ACCEPTED,
        Outcome::Rejected => DESC_REJECTED,
        Outcome::Released => DESC_RELEASED,
    };
    Value::described(descriptor, Value::List(Vec::new()))
}

/// Encode a performative into frame-body bytes.
pub fn encode(performative: &Performative) -> Bytes {
    let (descriptor, fields) = match performative {
        Performative::Open {
            container_id,
            idle_timeout_ms,
        } => (
            DESC_OPEN,
            vec![
                Value::Str(container_id.clone()),
                Value::Null,
                Value::Uint(super::framing::MAX_FRAME_SIZE as u32),
                Value::Null,
                opt_uint(*idle_timeout_ms),
            ],
        ),
        Performative::Begin {
            next_outgoing_id,
            incoming_window,
            outgoing_window,
        } => (
            DESC_BEGIN,
            vec![
                Value::Null,
                Value::Uint(*next_outgoing_id),
                Value::Uint(*incoming_window),
                Value::Uint(*outgoing_window),
            ],
        ),
        Performative::Attach {
            name,
            handle,
            receiver,
        } => (
            DESC_ATTACH,
            vec![
                Value::Str(name.clone()),
                Value::Uint(*handle),
                Value::Bool(*receiver),
            ],
        ),
        Performative::Flow {
            next_incoming_id,
            incoming_window,
            next_outgoing_id,
            outgoing_window,
            handle,
            delivery_count,
            link_credit,
        } => (
            DESC_FLOW,
            vec![
                opt_uint(*next_incoming_id),
                Value::Uint(*incoming_window),
                Value::Uint(*next_outgoing_id),
                Value::Uint(*outgoing_window),
                opt_uint(*handle),
                opt_uint(*delivery_count),
                opt_uint(*link_credit),
            ],
        ),
        Performative::Transfer {
            handle,
            delivery_id,
            delivery_tag,
            settled,
            more,
        } => (
            DESC_TRANSFER,
            vec![
                Value::Uint(*handle),
                opt_uint(*delivery_id),
                Value::Binary(delivery_tag.clone()),
                Value::Uint(0),
                Value::Bool(*settled),
                Value::Bool(*more),
            ],
        ),
        Performative::Disposition {
            receiver,
            first,
            last,
            settled,
            outcome,
        } => (
            DESC_DISPOSITION,
            vec![
                Value::Bool(*receiver),
                Value::Uint(*first),
                opt_uint(*last),
                Value::Bool(*settled),
                match outcome {
                    Some(outcome) => outcome_value(*outcome),
                    None => Value::Null,
                },
            ],
        ),
        Performative::Detach { handle, closed } => (
            DESC_DETACH,
            vec![Value::Uint(*handle), Value::Bool(*closed)],
        ),
        Performative::End => (DESC_END, Vec::new()),
        Performative::Close { error } => (
            DESC_CLOSE,
            match error {
                Some(e) => vec![Value::described(
                    DESC_ERROR,
                    Value::List(vec![
                        Value::Symbol(e.condition.clone()),
                        match &e.description {
                            Some(d) => Value::Str(d.clone()),
                            None => Value::Null,
                        },
                    ]),
                )],
                None => Vec::new(),
            },
        ),
        Performative::SaslMechanisms { mechanisms } => (
            DESC_SASL_MECHANISMS,
            vec![match mechanisms.len() {
                0 => Value::Null,
                1 => Value::Symbol(mechanisms[0].clone()),
                _ => Value::List(
                    mechanisms
                        .iter()
                        .map(|m| Value::Symbol(m.clone()))
                        .collect(),
                ),
            }],
        ),
        Performative::SaslInit {
            mechanism,
            initial_response,
        } => (
            DESC_SASL_INIT,
            vec![
                Value::Symbol(mechanism.clone()),
                Value::Binary(initial_response.clone()),
            ],
        ),
        Performative::SaslOutcome { code } => {
            (DESC_SASL_OUTCOME, vec![Value::Ubyte(*code)])
        }
    };

    let mut buf = BytesMut::new();
    encode_value(
        &Value::described(descriptor, Value::List(fields)),
        &mut buf,
    );
    buf.freeze()
}

struct Fields(Vec<Value>);

impl Fields {
    fn get(&self, index: usize) -> &Value {
        self.0.get(index).unwrap_or(&Value::Null)
    }

    fn uint(&self, index: usize) -> Option<u32> {
        self.get(index).as_u32()
    }

    fn require_uint(&self, index: usize, what: &str) -> Result<u32, CodecError> {
        self.uint(index)
            .ok_or_else(|| CodecError::Malformed(format!("missing {}", what)))
    }

    fn str(&self, index: usize) -> Option<String> {
        self.get(index).as_str().map(|s| s.to_string())
    }

    fn bool_or(&self, index: usize, default: bool) -> bool {
        self.get(index).as_bool().unwrap_or(default)
    }

    fn bytes(&self, index: usize) -> Option<Vec<u8>> {
        self.get(index).as_bytes().map(|b| b.to_vec())
    }
}

fn decode_outcome(value: &Value) -> Option<Outcome> {
    if let Value::Described(descriptor, _) = value {
        match descriptor.as_u64() {
            Some(DESC_ACCEPTED) => Some(Outcome::Accepted),
            Some(DESC_REJECTED) => Some(Outcome::Rejected),
            Some(DESC_RELEASED) => Some(Outcome::Released),
            _ => None,
        }
    } else {
        None
    }
}

fn decode_error(value: &Value) -> Option<AmqpError> {
    if let Value::Described(descriptor, body) = value {
        if descriptor.as_u64() == Some(DESC_ERROR) {
            if let Value::List(fields) = body.as_ref() {
                let fields = Fields(fields.clone());
                return Some(AmqpError {
                    condition: fields.str(0).unwrap_or_default(),
                    description: fields.str(1),
                });
            }
        }
    }
    None
}

/// Decode the performative at the front of a frame body. Returns the
/// performative and the bytes consumed; any remainder is message payload.
pub fn decode(body: &[u8]) -> Result<(Performative, usize), CodecError> {
    let (value, used) = decode_value(body)?;
    let (descriptor, fields) = match value {
        Value::Described(descriptor, fields) => {
            let descriptor = descriptor
                .as_u64()
                .ok_or_else(|| CodecError::Malformed("non-numeric descriptor".to_string()))?;
            let fields = match *fields {
                Value::List(items) => Fields(items),
                _ => return Err(CodecError::Malformed("performative body not a list".to_string())),
            };
            (descriptor, fields)
        }
        _ => return Err(CodecError::Malformed("frame body not described".to_string())),
    };

    let performative = match descriptor {
        DESC_OPEN => Performative::Open {
            container_id: fields
                .str(0)
                .ok_or_else(|| CodecError::Malformed("open without container-id".to_string()))?,
            idle_timeout_ms: fields.uint(4),
        },
        DESC_BEGIN => Performative::Begin {
            next_outgoing_id: fields.require_uint(1, "begin next-outgoing-id")?,
            incoming_window: fields.require_uint(2, "begin incoming-window")?,
            outgoing_window: fields.require_uint(3, "begin outgoing-window")?,
        },
        DESC_ATTACH => Performative::Attach {
            name: fields
                .str(0)
                .ok_or_else(|| CodecError::Malformed("attach without name".to_string()))?,
            handle: fields.require_uint(1, "attach handle")?,
            receiver: fields.bool_or(2, false),
        },
        DESC_FLOW => Performative::Flow {
            next_incoming_id: fields.uint(0),
            incoming_window: fields.require_uint(1, "flow incoming-window")?,
            next_outgoing_id: fields.require_uint(2, "flow next-outgoing-id")?,
            outgoing_window: fields.require_uint(3, "flow outgoing-window")?,
            handle: fields.uint(4),
            delivery_count: fields.uint(5),
            link_credit: fields.uint(6),
        },
        DESC_TRANSFER => Performative::Transfer {
            handle: fields.require_uint(0, "transfer handle")?,
            delivery_id: fields.uint(1),
            delivery_tag: fields.bytes(2).unwrap_or_default(),
            settled: fields.bool_or(4, false),
            more: fields.bool_or(5, false),
        },
        DESC_DISPOSITION => Performative::Disposition {
            receiver: fields.bool_or(0, false),
            first: fields.require_uint(1, "disposition first")?,
            last: fields.uint(2),
            settled: fields.bool_or(3, false),
            outcome: decode_outcome(fields.get(4)),
        },
        DESC_DETACH => Performative::Detach {
            handle: fields.require_uint(0, "detach handle")?,
            closed: fields.bool_or(1, false),
        },
        DESC_END => Performative::End,
        DESC_CLOSE => Performative::Close {
            error: decode_error(fields.get(0)),
        },
        DESC_SASL_MECHANISMS => {
            let mechanisms = match fields.get(0) {
                Value::Symbol(s) | Value::Str(s) => vec![s.clone()],
                Value::List(items) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect(),
                _ => Vec::new(),
            };
            Performative::SaslMechanisms { mechanisms }
        }
        DESC_SASL_INIT => Performative::SaslInit {
            mechanism: fields
                .str(0)
                .ok_or_else(|| CodecError::Malformed("sasl-init without mechanism".to_string()))?,
            initial_response: fields.bytes(1).unwrap_or_default(),
        },
        DESC_SASL_OUTCOME => Performative::SaslOutcome {
            code: match fields.get(0) {
                Value::Ubyte(code) => *code,
                other => other
                    .as_u32()
                    .map(|v| v as u8)
                    .ok_or_else(|| CodecError::Malformed("sasl-outcome without code".to_string()))?,
            },
        },
        other => {
            return Err(CodecError::Malformed(format!(
                "unknown performative descriptor 0x{:02x}",
                other
            )))
        }
    };
    Ok((performative, used))
}
