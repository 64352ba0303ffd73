//! # AMQP Engine
//!
//! A sans-io AMQP 1.0 protocol engine for one peer connection: one
//! session, one sender link, one receiver link, presettled=false. The
//! owning connection task feeds it decrypted bytes, drains the bytes it
//! produces, and forwards its events; the engine itself never touches a
//! socket and is single-threaded by construction.
//!
//! ## Wire Sequence
//!
//! ```text
//! client                                server
//!   │ ── SASL header ──────────────────► │
//!   │ ◄───────────── SASL header + mechs │
//!   │ ── sasl-init(PLAIN) ─────────────► │
//!   │ ◄──────────────────── sasl-outcome │
//!   │ ── AMQP header ──────────────────► │
//!   │ ◄───────────────────── AMQP header │
//!   │ ── open, begin, attach×2, flow ──► │
//!   │ ◄── open, begin, attach×2, flow ── │
//!   │            ... transfers ...       │
//! ```
//!
//! ## Delivery Semantics
//!
//! Outbound transfers are unsettled; the peer's disposition resolves the
//! registered handle (`accepted` ⇒ `Acknowledged`, `rejected`/`released`
//! ⇒ `Rejected`). Handles still unresolved when the connection closes
//! resolve to `Failed`. Inbound deliveries consume receiver credit which
//! is only replenished when the application calls [`Engine::complete`],
//! which also emits the corresponding disposition.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, warn};

use super::codec::CodecError;
use super::framing::{
    Frame, FrameCodec, FRAME_TYPE_AMQP, FRAME_TYPE_SASL, PROTOCOL_HEADER_AMQP,
    PROTOCOL_HEADER_SASL,
};
use super::message::{decode_message, DecodedMessage, DeliveryState};
use super::performative::{
    self, AmqpError, Outcome, Performative, SASL_CODE_AUTH, SASL_CODE_OK,
};

/// Credit window granted to the peer's sender.
const RECEIVER_WINDOW: u32 = 64;
/// Session transfer windows.
const SESSION_WINDOW: u32 = 2048;
/// Local handles: sender link then receiver link.
const SENDER_HANDLE: u32 = 0;
const RECEIVER_HANDLE: u32 = 1;

/// Engine configuration, told rather than discovered.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub server_mode: bool,
    /// Local identity; becomes the AMQP container-id.
    pub container_id: String,
    /// Identity the peer must present in its open.
    pub remote_container: String,
    pub sasl_user: String,
    pub sasl_password: String,
    /// Log every performative sent and received.
    pub frame_trace: bool,
    /// Idle timeout requested from the peer.
    pub idle_timeout: Option<Duration>,
}

/// Events surfaced to the owning connection task.
#[derive(Debug)]
pub enum EngineEvent {
    /// Handshake, session, and links are up; transfers may flow.
    Ready,
    /// An inbound delivery; must be completed to replenish credit.
    Received {
        delivery_id: u32,
        message: DecodedMessage,
    },
    /// The connection is finished, cleanly or otherwise.
    Closed { error: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SaslHeader,
    Sasl,
    AmqpHeader,
    Opening,
    Active,
    Closing,
    Closed,
}

pub struct Engine {
    cfg: EngineConfig,
    phase: Phase,
    inbound: BytesMut,
    outbound: BytesMut,
    codec: FrameCodec,
    events: VecDeque<EngineEvent>,

    remote_open_seen: bool,
    remote_begin_seen: bool,
    remote_sender_handle: Option<u32>,
    remote_receiver_handle: Option<u32>,
    peer_idle_timeout_ms: Option<u32>,

    // Sender side.
    sent_count: u32,
    next_tag: u64,
    peer_delivery_count: u32,
    peer_link_credit: u32,
    pending_sends: VecDeque<(Vec<u8>, Bytes, oneshot::Sender<DeliveryState>)>,
    unsettled: BTreeMap<u32, oneshot::Sender<DeliveryState>>,

    // Receiver side.
    received_count: u32,
    outstanding_inbound: u32,

    // Heartbeat bookkeeping, driven entirely through tick().
    sent_since_tick: bool,
    last_activity: Option<Instant>,
}

impl Engine {
    pub fn new(cfg: EngineConfig) -> Self {
        let mut engine = Engine {
            cfg,
            phase: Phase::SaslHeader,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            codec: FrameCodec,
            events: VecDeque::new(),
            remote_open_seen: false,
            remote_begin_seen: false,
            remote_sender_handle: None,
            remote_receiver_handle: None,
            peer_idle_timeout_ms: None,
            sent_count: 0,
            next_tag: 0,
            peer_delivery_count: 0,
            peer_link_credit: 0,
            pending_sends: VecDeque::new(),
            unsettled: BTreeMap::new(),
            received_count: 0,
            outstanding_inbound: 0,
            sent_since_tick: false,
            last_activity: None,
        };
        if !engine.cfg.server_mode {
            engine.outbound.extend_from_slice(&PROTOCOL_HEADER_SASL);
            engine.sent_since_tick = true;
        }
        engine
    }

    /// Feed bytes read from the transport.
    pub fn feed_inbound(&mut self, bytes: &[u8]) {
        if self.phase == Phase::Closed {
            return;
        }
        self.inbound.extend_from_slice(bytes);
        self.process();
    }

    /// Take the bytes the engine wants written to the transport.
    pub fn drain_outbound(&mut self) -> Bytes {
        self.outbound.split().freeze()
    }

    /// Pop the next pending event.
    pub fn poll_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Hand an encoded bare message to the sender link. Returns the
    /// delivery tag. The completion sender resolves on disposition.
    pub fn enqueue_send(
        &mut self,
        message: Bytes,
        completion: oneshot::Sender<DeliveryState>,
    ) -> Vec<u8> {
        let tag = self.next_tag.to_be_bytes().to_vec();
        self.next_tag += 1;
        if matches!(self.phase, Phase::Closing | Phase::Closed) {
            let _ = completion.send(DeliveryState::Failed);
            return tag;
        }
        self.pending_sends.push_back((tag.clone(), message, completion));
        self.flush_sends();
        tag
    }

    /// Receiver-side accept/reject of an inbound delivery. Emits the
    /// disposition and returns the credit the delivery was holding.
    pub fn complete(&mut self, delivery_id: u32, accepted: bool) {
        if self.phase != Phase::Active {
            return;
        }
        let outcome = if accepted {
            Outcome::Accepted
        } else {
            Outcome::Rejected
        };
        self.send_amqp(&Performative::Disposition {
            receiver: true,
            first: delivery_id,
            last: None,
            settled: true,
            outcome: Some(outcome),
        });
        self.outstanding_inbound = self.outstanding_inbound.saturating_sub(1);
        self.send_receiver_flow();
    }

    /// Begin an orderly close. Remaining outbound bytes must still be
    /// drained and written.
    pub fn close(&mut self) {
        match self.phase {
            Phase::Closed | Phase::Closing => return,
            Phase::Active | Phase::Opening => {
                self.send_amqp(&Performative::Close { error: None });
                self.phase = Phase::Closing;
            }
            _ => {
                self.phase = Phase::Closed;
            }
        }
        self.fail_outstanding();
    }

    /// Drive protocol timers. Sends an idle heartbeat when the peer's
    /// negotiated timeout requires one; returns the next deadline.
    pub fn tick(&mut self, now: Instant) -> Option<Instant> {
        let timeout_ms = self.peer_idle_timeout_ms?;
        if timeout_ms == 0 || self.phase != Phase::Active {
            return None;
        }
        let interval = Duration::from_millis(u64::from(timeout_ms) / 2).max(Duration::from_secs(1));
        if self.sent_since_tick {
            self.last_activity = Some(now);
            self.sent_since_tick = false;
        }
        let last = *self.last_activity.get_or_insert(now);
        if now >= last + interval {
            self.send_frame(Frame::heartbeat());
            self.last_activity = Some(now);
            self.sent_since_tick = false;
            Some(now + interval)
        } else {
            Some(last + interval)
        }
    }

    // ────────────────────────────────────────────────────────────────
    // Inbound processing
    // ────────────────────────────────────────────────────────────────

    fn process(&mut self) {
        loop {
            match self.phase {
                Phase::SaslHeader => {
                    if !self.try_consume_header(&PROTOCOL_HEADER_SASL, "SASL") {
                        return;
                    }
                    if self.phase == Phase::Closed {
                        return;
                    }
                    if self.cfg.server_mode {
                        self.outbound.extend_from_slice(&PROTOCOL_HEADER_SASL);
                        self.sent_since_tick = true;
                        self.send_sasl(&Performative::SaslMechanisms {
                            mechanisms: vec!["PLAIN".to_string()],
                        });
                    }
                    self.phase = Phase::Sasl;
                }
                Phase::AmqpHeader => {
                    if !self.try_consume_header(&PROTOCOL_HEADER_AMQP, "AMQP") {
                        return;
                    }
                    if self.phase == Phase::Closed {
                        return;
                    }
                    if self.cfg.server_mode {
                        self.outbound.extend_from_slice(&PROTOCOL_HEADER_AMQP);
                        self.sent_since_tick = true;
                    }
                    self.send_connection_setup();
                    self.phase = Phase::Opening;
                }
                Phase::Closed => return,
                _ => {
                    let frame = match self.codec.decode(&mut self.inbound) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => return,
                        Err(e) => {
                            self.protocol_error(format!("framing: {}", e));
                            return;
                        }
                    };
                    if frame.body.is_empty() {
                        // Idle heartbeat.
                        continue;
                    }
                    if let Err(e) = self.handle_frame(frame) {
                        self.protocol_error(format!("performative: {}", e));
                        return;
                    }
                }
            }
        }
    }

    /// Consume an 8-byte protocol header once fully buffered. A wrong
    /// header becomes a protocol error; the caller re-checks the phase.
    fn try_consume_header(&mut self, expected: &[u8; 8], layer: &str) -> bool {
        if self.inbound.len() < 8 {
            return false;
        }
        let header = self.inbound.split_to(8);
        if header.as_ref() != expected {
            self.protocol_error(format!("peer sent wrong {} protocol header", layer));
        }
        true
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), CodecError> {
        let (performative, used) = performative::decode(&frame.body)?;
        if self.cfg.frame_trace {
            info!(direction = "recv", frame = ?performative, "amqp frame");
        }
        let payload = frame.body.slice(used..);
        match frame.frame_type {
            FRAME_TYPE_SASL => self.handle_sasl(performative),
            FRAME_TYPE_AMQP => self.handle_amqp(performative, payload),
            other => {
                self.protocol_error(format!("unknown frame type {}", other));
                Ok(())
            }
        }
    }

    fn handle_sasl(&mut self, performative: Performative) -> Result<(), CodecError> {
        if self.phase != Phase::Sasl {
            self.protocol_error("SASL frame outside SASL negotiation".to_string());
            return Ok(());
        }
        match (self.cfg.server_mode, performative) {
            (false, Performative::SaslMechanisms { mechanisms }) => {
                if !mechanisms.iter().any(|m| m == "PLAIN") {
                    self.protocol_error("peer does not offer SASL PLAIN".to_string());
                    return Ok(());
                }
                let mut response =
                    Vec::with_capacity(2 + self.cfg.sasl_user.len() + self.cfg.sasl_password.len());
                response.push(0);
                response.extend_from_slice(self.cfg.sasl_user.as_bytes());
                response.push(0);
                response.extend_from_slice(self.cfg.sasl_password.as_bytes());
                self.send_sasl(&Performative::SaslInit {
                    mechanism: "PLAIN".to_string(),
                    initial_response: response,
                });
            }
            (false, Performative::SaslOutcome { code }) => {
                if code == SASL_CODE_OK {
                    self.outbound.extend_from_slice(&PROTOCOL_HEADER_AMQP);
                    self.sent_since_tick = true;
                    self.phase = Phase::AmqpHeader;
                } else {
                    self.protocol_error(format!("SASL authentication failed (code {})", code));
                }
            }
            (true, Performative::SaslInit {
                mechanism,
                initial_response,
            }) => {
                let mut expected =
                    Vec::with_capacity(2 + self.cfg.sasl_user.len() + self.cfg.sasl_password.len());
                expected.push(0);
                expected.extend_from_slice(self.cfg.sasl_user.as_bytes());
                expected.push(0);
                expected.extend_from_slice(self.cfg.sasl_password.as_bytes());
                if mechanism == "PLAIN" && initial_response == expected {
                    self.send_sasl(&Performative::SaslOutcome { code: SASL_CODE_OK });
                    self.phase = Phase::AmqpHeader;
                } else {
                    warn!("rejecting peer with bad SASL credentials");
                    self.send_sasl(&Performative::SaslOutcome {
                        code: SASL_CODE_AUTH,
                    });
                    self.protocol_error("SASL credentials rejected".to_string());
                }
            }
            (_, other) => {
                self.protocol_error(format!("unexpected SASL frame {}", other.name()));
            }
        }
        Ok(())
    }

    fn handle_amqp(
        &mut self,
        performative: Performative,
        payload: Bytes,
    ) -> Result<(), CodecError> {
        match performative {
            Performative::Open {
                container_id,
                idle_timeout_ms,
            } => {
                if container_id != self.cfg.remote_container {
                    self.protocol_error(format!(
                        "peer opened as {:?}, expected {:?}",
                        container_id, self.cfg.remote_container
                    ));
                    return Ok(());
                }
                self.peer_idle_timeout_ms = idle_timeout_ms;
                self.remote_open_seen = true;
                self.maybe_activate();
            }
            Performative::Begin { .. } => {
                self.remote_begin_seen = true;
                self.maybe_activate();
            }
            Performative::Attach {
                handle, receiver, ..
            } => {
                if receiver {
                    self.remote_receiver_handle = Some(handle);
                } else {
                    self.remote_sender_handle = Some(handle);
                }
                self.maybe_activate();
            }
            Performative::Flow {
                handle,
                delivery_count,
                link_credit,
                ..
            } => {
                if handle.is_some() && handle == self.remote_receiver_handle {
                    self.peer_delivery_count = delivery_count.unwrap_or(0);
                    self.peer_link_credit = link_credit.unwrap_or(0);
                    self.flush_sends();
                }
            }
            Performative::Transfer {
                handle,
                delivery_id,
                more,
                ..
            } => {
                if Some(handle) != self.remote_sender_handle {
                    self.protocol_error(format!("transfer on unknown link handle {}", handle));
                    return Ok(());
                }
                if more {
                    self.protocol_error("multi-frame transfers unsupported".to_string());
                    return Ok(());
                }
                let delivery_id = match delivery_id {
                    Some(id) => id,
                    None => {
                        self.protocol_error("transfer without delivery-id".to_string());
                        return Ok(());
                    }
                };
                let message = decode_message(&payload)?;
                self.received_count = self.received_count.wrapping_add(1);
                self.outstanding_inbound += 1;
                self.events
                    .push_back(EngineEvent::Received {
                        delivery_id,
                        message,
                    });
            }
            Performative::Disposition {
                receiver,
                first,
                last,
                settled,
                outcome,
            } => {
                if !receiver {
                    // Sender echoing settlement; nothing to resolve.
                    return Ok(());
                }
                let last = last.unwrap_or(first);
                if first > last {
                    self.protocol_error("disposition range inverted".to_string());
                    return Ok(());
                }
                // Walk only our own unsettled ids; a hostile range cannot
                // force a full-u32 sweep.
                let in_range: Vec<u32> = self
                    .unsettled
                    .range(first..=last)
                    .map(|(id, _)| *id)
                    .collect();
                for id in in_range {
                    if let Some(tx) = self.unsettled.remove(&id) {
                        let state = match outcome {
                            Some(Outcome::Accepted) => DeliveryState::Acknowledged,
                            Some(Outcome::Rejected) | Some(Outcome::Released) => {
                                DeliveryState::Rejected
                            }
                            None => DeliveryState::Rejected,
                        };
                        let _ = tx.send(state);
                    }
                }
                if !settled {
                    self.send_amqp(&Performative::Disposition {
                        receiver: false,
                        first,
                        last: Some(last),
                        settled: true,
                        outcome,
                    });
                }
            }
            Performative::Close { error } => {
                if self.phase != Phase::Closing {
                    self.send_amqp(&Performative::Close { error: None });
                }
                self.phase = Phase::Closed;
                self.fail_outstanding();
                self.events.push_back(EngineEvent::Closed {
                    error: error.map(|e| format!("{}: {}", e.condition, e.description.unwrap_or_default())),
                });
            }
            Performative::Detach { .. } | Performative::End => {
                // The peer is tearing down its half; finish the connection.
                self.close();
                self.events.push_back(EngineEvent::Closed { error: None });
            }
            other @ (Performative::SaslMechanisms { .. }
            | Performative::SaslInit { .. }
            | Performative::SaslOutcome { .. }) => {
                self.protocol_error(format!("SASL frame {} on AMQP layer", other.name()));
            }
        }
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────
    // Outbound helpers
    // ────────────────────────────────────────────────────────────────

    fn send_connection_setup(&mut self) {
        let idle_ms = self
            .cfg
            .idle_timeout
            .map(|t| u32::try_from(t.as_millis()).unwrap_or(u32::MAX));
        let open = Performative::Open {
            container_id: self.cfg.container_id.clone(),
            idle_timeout_ms: idle_ms,
        };
        let begin = Performative::Begin {
            next_outgoing_id: 0,
            incoming_window: SESSION_WINDOW,
            outgoing_window: SESSION_WINDOW,
        };
        let sender_attach = Performative::Attach {
            name: format!("{}->{}", self.cfg.container_id, self.cfg.remote_container),
            handle: SENDER_HANDLE,
            receiver: false,
        };
        let receiver_attach = Performative::Attach {
            name: format!("{}->{}", self.cfg.remote_container, self.cfg.container_id),
            handle: RECEIVER_HANDLE,
            receiver: true,
        };
        self.send_amqp(&open);
        self.send_amqp(&begin);
        self.send_amqp(&sender_attach);
        self.send_amqp(&receiver_attach);
        self.send_receiver_flow();
    }

    fn send_receiver_flow(&mut self) {
        let flow = Performative::Flow {
            next_incoming_id: Some(self.received_count),
            incoming_window: SESSION_WINDOW,
            next_outgoing_id: self.sent_count,
            outgoing_window: SESSION_WINDOW,
            handle: Some(RECEIVER_HANDLE),
            delivery_count: Some(self.received_count),
            link_credit: Some(RECEIVER_WINDOW.saturating_sub(self.outstanding_inbound)),
        };
        self.send_amqp(&flow);
    }

    fn maybe_activate(&mut self) {
        if self.phase == Phase::Opening
            && self.remote_open_seen
            && self.remote_begin_seen
            && self.remote_sender_handle.is_some()
            && self.remote_receiver_handle.is_some()
        {
            self.phase = Phase::Active;
            debug!(peer = %self.cfg.remote_container, "amqp transport ready");
            self.events.push_back(EngineEvent::Ready);
            self.flush_sends();
        }
    }

    /// Credit available to our sender right now.
    fn sender_available(&self) -> u32 {
        self.peer_delivery_count
            .wrapping_add(self.peer_link_credit)
            .wrapping_sub(self.sent_count)
    }

    fn flush_sends(&mut self) {
        if self.phase != Phase::Active {
            return;
        }
        while !self.pending_sends.is_empty() && self.sender_available() > 0 {
            let (tag, message, completion) = match self.pending_sends.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            let delivery_id = self.sent_count;
            self.sent_count = self.sent_count.wrapping_add(1);
            let transfer = Performative::Transfer {
                handle: SENDER_HANDLE,
                delivery_id: Some(delivery_id),
                delivery_tag: tag,
                settled: false,
                more: false,
            };
            let mut body = BytesMut::from(performative::encode(&transfer).as_ref());
            body.extend_from_slice(&message);
            if self.cfg.frame_trace {
                info!(direction = "send", frame = ?transfer, payload = message.len(), "amqp frame");
            }
            self.send_frame(Frame::amqp(0, body.freeze()));
            self.unsettled.insert(delivery_id, completion);
        }
    }

    fn send_amqp(&mut self, performative: &Performative) {
        if self.cfg.frame_trace {
            info!(direction = "send", frame = ?performative, "amqp frame");
        }
        self.send_frame(Frame::amqp(0, performative::encode(performative)));
    }

    fn send_sasl(&mut self, performative: &Performative) {
        if self.cfg.frame_trace {
            info!(direction = "send", frame = ?performative, "amqp frame");
        }
        self.send_frame(Frame::sasl(performative::encode(performative)));
    }

    fn send_frame(&mut self, frame: Frame) {
        let frame_type = frame.frame_type;
        if let Err(e) = self.codec.encode(frame, &mut self.outbound) {
            warn!(error = %e, frame_type, "dropping unencodable frame");
            return;
        }
        self.sent_since_tick = true;
    }

    fn protocol_error(&mut self, message: String) {
        if self.phase == Phase::Closed {
            return;
        }
        warn!(error = %message, "amqp protocol error");
        if matches!(self.phase, Phase::Opening | Phase::Active | Phase::Closing) {
            self.send_amqp(&Performative::Close {
                error: Some(AmqpError {
                    condition: "amqp:connection:framing-error".to_string(),
                    description: Some(message.clone()),
                }),
            });
        }
        self.phase = Phase::Closed;
        self.fail_outstanding();
        self.events
            .push_back(EngineEvent::Closed {
                error: Some(message),
            });
    }

    /// Unterminated handles transition to `Failed` at connection close.
    fn fail_outstanding(&mut self) {
        for (_, tx) in std::mem::take(&mut self.unsettled) {
            let _ = tx.send(DeliveryState::Failed);
        }
        for (_, _, tx) in std::mem::take(&mut self.pending_sends) {
            let _ = tx.send(DeliveryState::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::message::encode_message;
    use std::collections::BTreeMap;

    fn client_config() -> EngineConfig {
        EngineConfig {
            server_mode: false,
            container_id: "O=Bob Ltd, L=Paris, C=FR".to_string(),
            remote_container: "O=Alice Corp, L=London, C=GB".to_string(),
            sasl_user: "zone-peer".to_string(),
            sasl_password: "peer".to_string(),
            frame_trace: false,
            idle_timeout: None,
        }
    }

    fn server_config() -> EngineConfig {
        EngineConfig {
            server_mode: true,
            container_id: "O=Alice Corp, L=London, C=GB".to_string(),
            remote_container: "O=Bob Ltd, L=Paris, C=FR".to_string(),
            sasl_user: "zone-peer".to_string(),
            sasl_password: "peer".to_string(),
            frame_trace: false,
            idle_timeout: None,
        }
    }

    /// Shuttle bytes between two engines until both go quiet.
    fn pump(a: &mut Engine, b: &mut Engine) {
        loop {
            let from_a = a.drain_outbound();
            let from_b = b.drain_outbound();
            if from_a.is_empty() && from_b.is_empty() {
                break;
            }
            if !from_a.is_empty() {
                b.feed_inbound(&from_a);
            }
            if !from_b.is_empty() {
                a.feed_inbound(&from_b);
            }
        }
    }

    fn expect_ready(engine: &mut Engine) {
        let mut ready = false;
        while let Some(event) = engine.poll_event() {
            if matches!(event, EngineEvent::Ready) {
                ready = true;
            }
        }
        assert!(ready, "engine never became ready");
    }

    fn handshake() -> (Engine, Engine) {
        let mut client = Engine::new(client_config());
        let mut server = Engine::new(server_config());
        pump(&mut client, &mut server);
        expect_ready(&mut client);
        expect_ready(&mut server);
        (client, server)
    }

    #[test]
    fn test_handshake_reaches_ready_on_both_sides() {
        handshake();
    }

    #[test]
    fn test_transfer_and_acknowledgement() {
        let (mut client, mut server) = handshake();

        let message = encode_message("p2p.inbound", &BTreeMap::new(), b"Test");
        let (tx, rx) = oneshot::channel();
        let tag = client.enqueue_send(message, tx);
        assert_eq!(tag.len(), 8);
        pump(&mut client, &mut server);

        let delivery_id = match server.poll_event() {
            Some(EngineEvent::Received {
                delivery_id,
                message,
            }) => {
                assert_eq!(message.topic, "p2p.inbound");
                assert_eq!(message.payload.as_ref(), b"Test");
                delivery_id
            }
            other => panic!("expected Received, got {:?}", other),
        };

        server.complete(delivery_id, true);
        pump(&mut client, &mut server);
        assert_eq!(rx.blocking_recv().unwrap(), DeliveryState::Acknowledged);
    }

    #[test]
    fn test_rejected_delivery_resolves_rejected() {
        let (mut client, mut server) = handshake();
        let (tx, rx) = oneshot::channel();
        client.enqueue_send(
            encode_message("t", &BTreeMap::new(), b"payload"),
            tx,
        );
        pump(&mut client, &mut server);
        let delivery_id = match server.poll_event() {
            Some(EngineEvent::Received { delivery_id, .. }) => delivery_id,
            other => panic!("expected Received, got {:?}", other),
        };
        server.complete(delivery_id, false);
        pump(&mut client, &mut server);
        assert_eq!(rx.blocking_recv().unwrap(), DeliveryState::Rejected);
    }

    #[test]
    fn test_enqueue_before_ready_is_buffered() {
        let mut client = Engine::new(client_config());
        let mut server = Engine::new(server_config());
        let (tx, rx) = oneshot::channel();
        client.enqueue_send(
            encode_message("early", &BTreeMap::new(), b"queued"),
            tx,
        );
        pump(&mut client, &mut server);
        expect_ready(&mut client);
        let mut saw_message = false;
        while let Some(event) = server.poll_event() {
            if let EngineEvent::Received {
                delivery_id,
                message,
            } = event
            {
                assert_eq!(message.topic, "early");
                server.complete(delivery_id, true);
                saw_message = true;
            }
        }
        assert!(saw_message);
        pump(&mut client, &mut server);
        assert_eq!(rx.blocking_recv().unwrap(), DeliveryState::Acknowledged);
    }

    #[test]
    fn test_close_fails_unacknowledged_sends() {
        let (mut client, mut server) = handshake();
        let (tx, rx) = oneshot::channel();
        client.enqueue_send(encode_message("t", &BTreeMap::new(), b"x"), tx);
        pump(&mut client, &mut server);
        // Server never completes; client closes.
        client.close();
        pump(&mut client, &mut server);
        assert_eq!(rx.blocking_recv().unwrap(), DeliveryState::Failed);
        assert!(client.is_closed());
    }

    #[test]
    fn test_peer_close_emits_closed_event() {
        let (mut client, mut server) = handshake();
        client.close();
        pump(&mut client, &mut server);
        let mut closed = false;
        while let Some(event) = server.poll_event() {
            if matches!(event, EngineEvent::Closed { .. }) {
                closed = true;
            }
        }
        assert!(closed);
        assert!(server.is_closed());
    }

    #[test]
    fn test_wrong_remote_identity_fails_connection() {
        let mut client = Engine::new(client_config());
        let mut rogue_cfg = server_config();
        rogue_cfg.container_id = "O=Rogue, L=London, C=GB".to_string();
        let mut rogue = Engine::new(rogue_cfg);
        pump(&mut client, &mut rogue);
        let mut closed_with_error = false;
        while let Some(event) = client.poll_event() {
            if let EngineEvent::Closed { error: Some(_) } = event {
                closed_with_error = true;
            }
        }
        assert!(closed_with_error, "client accepted a mis-identified peer");
    }

    #[test]
    fn test_bad_sasl_credentials_rejected() {
        let mut bad_client_cfg = client_config();
        bad_client_cfg.sasl_password = "wrong".to_string();
        let mut client = Engine::new(bad_client_cfg);
        let mut server = Engine::new(server_config());
        pump(&mut client, &mut server);
        assert!(server.is_closed());
        assert!(client.is_closed());
    }

    #[test]
    fn test_credit_exhaustion_holds_messages() {
        let (mut client, mut server) = handshake();
        // Exhaust the receiver window without completing anything.
        let mut handles = Vec::new();
        for i in 0..RECEIVER_WINDOW + 10 {
            let (tx, rx) = oneshot::channel();
            client.enqueue_send(
                encode_message("t", &BTreeMap::new(), format!("m{}", i).as_bytes()),
                tx,
            );
            handles.push(rx);
        }
        pump(&mut client, &mut server);
        let mut received = Vec::new();
        while let Some(event) = server.poll_event() {
            if let EngineEvent::Received { delivery_id, .. } = event {
                received.push(delivery_id);
            }
        }
        assert_eq!(received.len() as u32, RECEIVER_WINDOW);

        // Completing the backlog replenishes credit and releases the rest.
        for id in received {
            server.complete(id, true);
        }
        pump(&mut client, &mut server);
        let mut remainder = 0;
        while let Some(event) = server.poll_event() {
            if let EngineEvent::Received { delivery_id, .. } = event {
                server.complete(delivery_id, true);
                remainder += 1;
            }
        }
        pump(&mut client, &mut server);
        assert_eq!(remainder, 10);
    }

    #[test]
    fn test_messages_complete_in_submission_order() {
        let (mut client, mut server) = handshake();
        let mut receivers = Vec::new();
        for i in 0..5 {
            let (tx, rx) = oneshot::channel();
            client.enqueue_send(
                encode_message("t", &BTreeMap::new(), format!("m{}", i).as_bytes()),
                tx,
            );
            receivers.push(rx);
        }
        pump(&mut client, &mut server);
        let mut order = Vec::new();
        while let Some(event) = server.poll_event() {
            if let EngineEvent::Received {
                delivery_id,
                message,
            } = event
            {
                order.push(String::from_utf8_lossy(&message.payload).to_string());
                server.complete(delivery_id, true);
            }
        }
        assert_eq!(order, vec!["m0", "m1", "m2", "m3", "m4"]);
        pump(&mut client, &mut server);
        for rx in receivers {
            assert_eq!(rx.blocking_recv().unwrap(), DeliveryState::Acknowledged);
        }
    }

    #[test]
    fn test_garbage_input_is_protocol_error() {
        let (mut client, _server) = handshake();
        client.feed_inbound(&[0xffu8; 64]);
        let mut closed = false;
        while let Some(event) = client.poll_event() {
            if matches!(event, EngineEvent::Closed { error: Some(_) }) {
                closed = true;
            }
        }
        assert!(closed);
    }

    #[test]
    fn test_tick_emits_heartbeat_for_peer_timeout() {
        let mut client_cfg = client_config();
        client_cfg.idle_timeout = Some(Duration::from_secs(4));
        // Server learns the client wants 4s heartbeats; its ticks emit them.
        let mut client = Engine::new(client_cfg);
        let mut server = Engine::new(server_config());
        pump(&mut client, &mut server);
        expect_ready(&mut server);

        let start = Instant::now();
        let deadline = server.tick(start);
        assert!(deadline.is_some());
        assert!(server.drain_outbound().is_empty());
        // Well past the half-timeout interval.
        server.tick(start + Duration::from_secs(3));
        let heartbeat = server.drain_outbound();
        assert!(!heartbeat.is_empty());
        client.feed_inbound(&heartbeat);
        assert!(!client.is_closed());
    }
}
