//! AMQP 1.0 frame codec.
//!
//! Each frame is an 8-byte header followed by the frame body:
//!
//! ```text
//! +-------------+--------+--------+----------------+------------------+
//! | size u32 BE | doff=2 | type   | channel u16 BE | body (size - 8)  |
//! +-------------+--------+--------+----------------+------------------+
//! ```
//!
//! `type` is 0 for AMQP frames and 1 for SASL frames. A frame whose size
//! is exactly the header length carries no body and acts as a heartbeat.
//! The frame length is validated before any allocation; oversized frames
//! are rejected with [`FrameError::FrameTooLarge`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Fixed header length.
const HEADER_LEN: usize = 8;

/// Upper bound on accepted frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol header opening the SASL layer: `AMQP` %d3.1.0.0.
pub const PROTOCOL_HEADER_SASL: [u8; 8] = [b'A', b'M', b'Q', b'P', 3, 1, 0, 0];
/// Protocol header opening the AMQP layer: `AMQP` %d0.1.0.0.
pub const PROTOCOL_HEADER_AMQP: [u8; 8] = [b'A', b'M', b'Q', b'P', 0, 1, 0, 0];

/// Frame type octet values.
pub const FRAME_TYPE_AMQP: u8 = 0;
pub const FRAME_TYPE_SASL: u8 = 1;

/// Error type for frame-level failures.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),
    #[error("frame header malformed: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One AMQP or SASL frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub channel: u16,
    /// Performative plus any payload; empty for heartbeats.
    pub body: Bytes,
}

impl Frame {
    pub fn amqp(channel: u16, body: Bytes) -> Self {
        Frame {
            frame_type: FRAME_TYPE_AMQP,
            channel,
            body,
        }
    }

    pub fn sasl(body: Bytes) -> Self {
        Frame {
            frame_type: FRAME_TYPE_SASL,
            channel: 0,
            body,
        }
    }

    /// An empty AMQP frame, used as an idle-timeout heartbeat.
    pub fn heartbeat() -> Self {
        Frame::amqp(0, Bytes::new())
    }
}

/// Length-prefixed frame codec; frame length is validated before the body
/// is buffered.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if size < HEADER_LEN {
            return Err(FrameError::Malformed(format!(
                "frame size {} below header length",
                size
            )));
        }
        if size > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(size));
        }
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let doff = src[4];
        if doff < 2 {
            return Err(FrameError::Malformed(format!("data offset {} below 2", doff)));
        }
        let body_start = doff as usize * 4;
        if body_start > size {
            return Err(FrameError::Malformed(
                "data offset beyond frame end".to_string(),
            ));
        }
        let frame_type = src[5];
        let channel = u16::from_be_bytes([src[6], src[7]]);

        let mut frame = src.split_to(size);
        frame.advance(body_start);
        Ok(Some(Frame {
            frame_type,
            channel,
            body: frame.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let size = HEADER_LEN + frame.body.len();
        if size > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(size));
        }
        dst.reserve(size);
        dst.put_u32(size as u32);
        dst.put_u8(2);
        dst.put_u8(frame.frame_type);
        dst.put_u16(frame.channel);
        dst.put_slice(&frame.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let mut codec = FrameCodec;
        let frame = Frame::amqp(3, Bytes::from_static(b"performative"));
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_heartbeat_round_trip() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Frame::heartbeat(), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::sasl(Bytes::from_static(b"abc")), &mut buf)
            .unwrap();
        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected_before_buffering() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_slice(&[2, 0, 0, 0]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_undersized_frame_rejected() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_slice(&[2, 0, 0, 0]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::amqp(0, Bytes::from_static(b"one")), &mut buf)
            .unwrap();
        codec
            .encode(Frame::amqp(1, Bytes::from_static(b"two")), &mut buf)
            .unwrap();
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.body, Bytes::from_static(b"one"));
        assert_eq!(second.channel, 1);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
