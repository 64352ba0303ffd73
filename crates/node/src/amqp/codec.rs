//! AMQP 1.0 primitive type codec.
//!
//! Encodes and decodes the subset of AMQP types the peer transport puts on
//! the wire: null, booleans, fixed-width integers with their compact
//! encodings, strings, symbols, binary, lists, maps, and described types.
//! Lengths are validated against the remaining buffer before any
//! allocation, so a hostile length prefix cannot balloon memory.

use bytes::{BufMut, BytesMut};
use std::fmt;

/// Error type for wire-level encode/decode failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer ended inside a value.
    Truncated,
    /// An unknown or unsupported type constructor byte.
    InvalidConstructor(u8),
    /// Structurally invalid data (bad counts, nested errors).
    Malformed(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Truncated => write!(f, "truncated AMQP value"),
            CodecError::InvalidConstructor(c) => {
                write!(f, "unsupported AMQP type constructor 0x{:02x}", c)
            }
            CodecError::Malformed(msg) => write!(f, "malformed AMQP value: {}", msg),
        }
    }
}

impl std::error::Error for CodecError {}

/// A decoded AMQP value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Ubyte(u8),
    Ushort(u16),
    Uint(u32),
    Ulong(u64),
    Int(i32),
    Long(i64),
    Str(String),
    Symbol(String),
    Binary(Vec<u8>),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    /// A described type: descriptor plus described value.
    Described(Box<Value>, Box<Value>),
}

impl Value {
    pub fn described(descriptor: u64, value: Value) -> Value {
        Value::Described(Box::new(Value::Ulong(descriptor)), Box::new(value))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Ubyte(v) => Some(u32::from(*v)),
            Value::Ushort(v) => Some(u32::from(*v)),
            Value::Uint(v) => Some(*v),
            Value::Ulong(v) => u32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Ubyte(v) => Some(u64::from(*v)),
            Value::Ushort(v) => Some(u64::from(*v)),
            Value::Uint(v) => Some(u64::from(*v)),
            Value::Ulong(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Encode a value onto the buffer.
pub fn encode_value(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Null => buf.put_u8(0x40),
        Value::Bool(true) => buf.put_u8(0x41),
        Value::Bool(false) => buf.put_u8(0x42),
        Value::Ubyte(v) => {
            buf.put_u8(0x50);
            buf.put_u8(*v);
        }
        Value::Ushort(v) => {
            buf.put_u8(0x60);
            buf.put_u16(*v);
        }
        Value::Uint(v) => match *v {
            0 => buf.put_u8(0x43),
            1..=255 => {
                buf.put_u8(0x52);
                buf.put_u8(*v as u8);
            }
            _ => {
                buf.put_u8(0x70);
                buf.put_u32(*v);
            }
        },
        Value::Ulong(v) => match *v {
            0 => buf.put_u8(0x44),
            1..=255 => {
                buf.put_u8(0x53);
                buf.put_u8(*v as u8);
            }
            _ => {
                buf.put_u8(0x80);
                buf.put_u64(*v);
            }
        },
        Value::Int(v) => {
            if (-128..=127).contains(v) {
                buf.put_u8(0x54);
                buf.put_i8(*v as i8);
            } else {
                buf.put_u8(0x71);
                buf.put_i32(*v);
            }
        }
        Value::Long(v) => {
            if (-128..=127).contains(v) {
                buf.put_u8(0x55);
                buf.put_i8(*v as i8);
            } else {
                buf.put_u8(0x81);
                buf.put_i64(*v);
            }
        }
        Value::Str(s) => encode_variable(buf, s.as_bytes(), 0xa1, 0xb1),
        Value::Symbol(s) => encode_variable(buf, s.as_bytes(), 0xa3, 0xb3),
        Value::Binary(b) => encode_variable(buf, b, 0xa0, 0xb0),
        Value::List(items) => {
            if items.is_empty() {
                buf.put_u8(0x45);
                return;
            }
            let mut body = BytesMut::new();
            for item in items {
                encode_value(item, &mut body);
            }
            encode_compound(buf, &body, items.len(), 0xc0, 0xd0);
        }
        Value::Map(pairs) => {
            let mut body = BytesMut::new();
            for (k, v) in pairs {
                encode_value(k, &mut body);
                encode_value(v, &mut body);
            }
            encode_compound(buf, &body, pairs.len() * 2, 0xc1, 0xd1);
        }
        Value::Described(descriptor, described) => {
            buf.put_u8(0x00);
            encode_value(descriptor, buf);
            encode_value(described, buf);
        }
    }
}

fn encode_variable(buf: &mut BytesMut, data: &[u8], small: u8, large: u8) {
    if data.len() <= 255 {
        buf.put_u8(small);
        buf.put_u8(data.len() as u8);
    } else {
        buf.put_u8(large);
        buf.put_u32(data.len() as u32);
    }
    buf.put_slice(data);
}

fn encode_compound(buf: &mut BytesMut, body: &[u8], count: usize, small: u8, large: u8) {
    // Compound size includes the count octet(s).
    if body.len() + 1 <= 255 && count <= 255 {
        buf.put_u8(small);
        buf.put_u8((body.len() + 1) as u8);
        buf.put_u8(count as u8);
    } else {
        buf.put_u8(large);
        buf.put_u32((body.len() + 4) as u32);
        buf.put_u32(count as u32);
    }
    buf.put_slice(body);
}

/// Decode one value from the front of `buf`; returns the value and the
/// number of bytes consumed.
pub fn decode_value(buf: &[u8]) -> Result<(Value, usize), CodecError> {
    let constructor = *buf.first().ok_or(CodecError::Truncated)?;
    let rest = &buf[1..];
    let (value, used) = match constructor {
        0x40 => (Value::Null, 0),
        0x41 => (Value::Bool(true), 0),
        0x42 => (Value::Bool(false), 0),
        0x43 => (Value::Uint(0), 0),
        0x44 => (Value::Ulong(0), 0),
        0x50 => (Value::Ubyte(read_u8(rest)?), 1),
        0x52 => (Value::Uint(u32::from(read_u8(rest)?)), 1),
        0x53 => (Value::Ulong(u64::from(read_u8(rest)?)), 1),
        0x54 => (Value::Int(i32::from(read_u8(rest)? as i8)), 1),
        0x55 => (Value::Long(i64::from(read_u8(rest)? as i8)), 1),
        0x60 => (Value::Ushort(read_u16(rest)?), 2),
        0x70 => (Value::Uint(read_u32(rest)?), 4),
        0x71 => (Value::Int(read_u32(rest)? as i32), 4),
        0x80 => (Value::Ulong(read_u64(rest)?), 8),
        0x81 => (Value::Long(read_u64(rest)? as i64), 8),
        0xa0 => {
            let (data, used) = read_variable_small(rest)?;
            (Value::Binary(data.to_vec()), used)
        }
        0xb0 => {
            let (data, used) = read_variable_large(rest)?;
            (Value::Binary(data.to_vec()), used)
        }
        0xa1 => {
            let (data, used) = read_variable_small(rest)?;
            (Value::Str(utf8(data)?), used)
        }
        0xb1 => {
            let (data, used) = read_variable_large(rest)?;
            (Value::Str(utf8(data)?), used)
        }
        0xa3 => {
            let (data, used) = read_variable_small(rest)?;
            (Value::Symbol(utf8(data)?), used)
        }
        0xb3 => {
            let (data, used) = read_variable_large(rest)?;
            (Value::Symbol(utf8(data)?), used)
        }
        0x45 => (Value::List(Vec::new()), 0),
        0xc0 => decode_list(rest, true)?,
        0xd0 => decode_list(rest, false)?,
        0xc1 => decode_map(rest, true)?,
        0xd1 => decode_map(rest, false)?,
        0x00 => {
            let (descriptor, d_used) = decode_value(rest)?;
            let (described, v_used) = decode_value(&rest[d_used..])?;
            (
                Value::Described(Box::new(descriptor), Box::new(described)),
                d_used + v_used,
            )
        }
        other => return Err(CodecError::InvalidConstructor(other)),
    };
    Ok((value, 1 + used))
}

fn read_u8(buf: &[u8]) -> Result<u8, CodecError> {
    buf.first().copied().ok_or(CodecError::Truncated)
}

fn read_u16(buf: &[u8]) -> Result<u16, CodecError> {
    if buf.len() < 2 {
        return Err(CodecError::Truncated);
    }
    Ok(u16::from_be_bytes([buf[0], buf[1]]))
}

fn read_u32(buf: &[u8]) -> Result<u32, CodecError> {
    if buf.len() < 4 {
        return Err(CodecError::Truncated);
    }
    Ok(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

fn read_u64(buf: &[u8]) -> Result<u64, CodecError> {
    if buf.len() < 8 {
        return Err(CodecError::Truncated);
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    Ok(u64::from_be_bytes(bytes))
}

fn read_variable_small(buf: &[u8]) -> Result<(&[u8], usize), CodecError> {
    let len = read_u8(buf)? as usize;
    let data = buf.get(1..1 + len).ok_or(CodecError::Truncated)?;
    Ok((data, 1 + len))
}

fn read_variable_large(buf: &[u8]) -> Result<(&[u8], usize), CodecError> {
    let len = read_u32(buf)? as usize;
    let data = buf.get(4..4 + len).ok_or(CodecError::Truncated)?;
    Ok((data, 4 + len))
}

fn utf8(data: &[u8]) -> Result<String, CodecError> {
    String::from_utf8(data.to_vec())
        .map_err(|_| CodecError::Malformed("non-UTF-8 string".to_string()))
}

fn decode_list(buf: &[u8], small: bool) -> Result<(Value, usize), CodecError> {
    let (size, count, header) = compound_header(buf, small)?;
    let body = buf
        .get(header..header + size)
        .ok_or(CodecError::Truncated)?;
    let mut items = Vec::with_capacity(count.min(256));
    let mut offset = 0;
    for _ in 0..count {
        let (item, used) = decode_value(&body[offset..])?;
        items.push(item);
        offset += used;
    }
    Ok((Value::List(items), header + size))
}

fn decode_map(buf: &[u8], small: bool) -> Result<(Value, usize), CodecError> {
    let (size, count, header) = compound_header(buf, small)?;
    if count % 2 != 0 {
        return Err(CodecError::Malformed("odd map element count".to_string()));
    }
    let body = buf
        .get(header..header + size)
        .ok_or(CodecError::Truncated)?;
    let mut pairs = Vec::with_capacity((count / 2).min(256));
    let mut offset = 0;
    for _ in 0..count / 2 {
        let (k, k_used) = decode_value(&body[offset..])?;
        offset += k_used;
        let (v, v_used) = decode_value(&body[offset..])?;
        offset += v_used;
        pairs.push((k, v));
    }
    Ok((Value::Map(pairs), header + size))
}

/// Returns (body size excluding count octets, element count, header bytes
/// consumed including count octets).
fn compound_header(buf: &[u8], small: bool) -> Result<(usize, usize, usize), CodecError> {
    if small {
        let size = read_u8(buf)? as usize;
        let count = read_u8(&buf[1..])? as usize;
        if size < 1 {
            return Err(CodecError::Malformed("compound size below count".to_string()));
        }
        Ok((size - 1, count, 2))
    } else {
        let size = read_u32(buf)? as usize;
        let count = read_u32(buf.get(4..).ok_or(CodecError::Truncated)?)? as usize;
        if size < 4 {
            return Err(CodecError::Malformed("compound size below count".to_string()));
        }
        Ok((size - 4, count, 8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value) {
        let mut buf = BytesMut::new();
        encode_value(&value, &mut buf);
        let (decoded, used) = decode_value(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_scalar_round_trips() {
        round_trip(Value::Null);
        round_trip(Value::Bool(true));
        round_trip(Value::Bool(false));
        round_trip(Value::Ubyte(7));
        round_trip(Value::Ushort(1024));
        round_trip(Value::Uint(0));
        round_trip(Value::Uint(200));
        round_trip(Value::Uint(70_000));
        round_trip(Value::Ulong(0));
        round_trip(Value::Ulong(42));
        round_trip(Value::Ulong(1 << 40));
        round_trip(Value::Int(-5));
        round_trip(Value::Int(123_456));
        round_trip(Value::Long(-1));
        round_trip(Value::Long(1 << 40));
    }

    #[test]
    fn test_string_symbol_binary_round_trips() {
        round_trip(Value::Str("p2p.inbound".to_string()));
        round_trip(Value::Str("x".repeat(300)));
        round_trip(Value::Symbol("PLAIN".to_string()));
        round_trip(Value::Binary(vec![0u8; 3]));
        round_trip(Value::Binary(vec![9u8; 1000]));
    }

    #[test]
    fn test_compound_round_trips() {
        round_trip(Value::List(vec![]));
        round_trip(Value::List(vec![
            Value::Str("a".to_string()),
            Value::Uint(1),
            Value::Null,
        ]));
        round_trip(Value::Map(vec![(
            Value::Str("topic".to_string()),
            Value::Str("p2p.inbound".to_string()),
        )]));
        round_trip(Value::described(
            0x14,
            Value::List(vec![Value::Uint(0), Value::Binary(vec![1, 2, 3])]),
        ));
        // Large list forces the 32-bit encoding.
        round_trip(Value::List(vec![Value::Binary(vec![0u8; 300]); 3]));
    }

    #[test]
    fn test_truncated_input() {
        let mut buf = BytesMut::new();
        encode_value(&Value::Str("hello".to_string()), &mut buf);
        for cut in 0..buf.len() {
            assert!(decode_value(&buf[..cut]).is_err() || cut == buf.len());
        }
    }

    #[test]
    fn test_hostile_length_does_not_allocate() {
        // str32 claiming 4 GiB with a 5-byte buffer must fail fast.
        let hostile = [0xb1, 0xff, 0xff, 0xff, 0xff];
        assert_eq!(decode_value(&hostile), Err(CodecError::Truncated));
    }

    #[test]
    fn test_unknown_constructor() {
        assert_eq!(
            decode_value(&[0x99]),
            Err(CodecError::InvalidConstructor(0x99))
        );
    }

    #[test]
    fn test_odd_map_count_rejected() {
        // map8 with size 2, count 1 (odd).
        let bad = [0xc1, 0x02, 0x01, 0x40];
        assert!(matches!(
            decode_value(&bad),
            Err(CodecError::Malformed(_))
        ));
    }
}
