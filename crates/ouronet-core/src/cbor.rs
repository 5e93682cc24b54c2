//! Deterministic CBOR encoding and structural decoding helpers.
//!
//! Encoding follows RFC 8949 core deterministic rules:
//! - Integers use the smallest valid encoding
//! - Definite lengths only
//! - Map keys sorted by encoded byte comparison
//! - No floats
//!
//! Decoding goes through `ciborium` into a [`Value`] and then through the
//! shape helpers below, so message codecs never index blindly into arrays.

use std::io::{self, Cursor};

use ciborium::value::{Integer, Value};

use crate::error::CodecError;
use crate::types::{BlockHash, Point, Tip};

/// CBOR tag for embedded encoded CBOR (`#6.24(bytes)`).
pub const TAG_ENCODED_CBOR: u64 = 24;

/// Encode a value to deterministic CBOR bytes.
pub fn encode(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    encode_value_to(&mut buf, value)?;
    Ok(buf)
}

/// Decode exactly one item; trailing bytes are an error.
pub fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
    match decode_prefix(bytes)? {
        Some((value, used)) if used == bytes.len() => Ok(value),
        Some((_, used)) => Err(CodecError::TrailingBytes(bytes.len() - used)),
        None => Err(CodecError::Truncated),
    }
}

/// Decode the first complete item in `bytes`.
///
/// Returns `Ok(None)` when the input ends before the item does, so callers
/// can wait for more data. Returns the item and the number of bytes it used.
pub fn decode_prefix(bytes: &[u8]) -> Result<Option<(Value, usize)>, CodecError> {
    if bytes.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(bytes);
    match ciborium::de::from_reader::<Value, _>(&mut cursor) {
        Ok(value) => Ok(Some((value, cursor.position() as usize))),
        Err(ciborium::de::Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(CodecError::Malformed(e.to_string())),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoder
// ─────────────────────────────────────────────────────────────────────────────

fn encode_value_to(buf: &mut Vec<u8>, value: &Value) -> Result<(), CodecError> {
    match value {
        Value::Integer(i) => encode_integer(buf, *i),
        Value::Bytes(b) => {
            encode_uint(buf, 2, b.len() as u64);
            buf.extend_from_slice(b);
        }
        Value::Text(s) => {
            encode_uint(buf, 3, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Array(arr) => {
            encode_uint(buf, 4, arr.len() as u64);
            for item in arr {
                encode_value_to(buf, item)?;
            }
        }
        Value::Map(entries) => encode_map_canonical(buf, entries)?,
        Value::Tag(tag, inner) => {
            encode_uint(buf, 6, *tag);
            encode_value_to(buf, inner)?;
        }
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        Value::Null => buf.push(0xf6),
        Value::Float(_) => return Err(CodecError::Encoding("floats are not supported".into())),
        _ => return Err(CodecError::Encoding("unsupported cbor value".into())),
    }
    Ok(())
}

/// Encode a CBOR integer (major types 0 and 1).
fn encode_integer(buf: &mut Vec<u8>, i: Integer) {
    let n: i128 = i.into();
    if n >= 0 {
        encode_uint(buf, 0, n as u64);
    } else {
        // -1 encodes as 0, -2 as 1, ...
        encode_uint(buf, 1, (-1 - n) as u64);
    }
}

/// Encode an unsigned argument with the given major type.
fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

/// Encode a map with keys sorted by their encoded bytes.
fn encode_map_canonical(buf: &mut Vec<u8>, entries: &[(Value, Value)]) -> Result<(), CodecError> {
    let mut pairs = Vec::with_capacity(entries.len());
    for (k, v) in entries {
        let mut key_buf = Vec::new();
        encode_value_to(&mut key_buf, k)?;
        pairs.push((key_buf, v));
    }
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    encode_uint(buf, 5, pairs.len() as u64);
    for (key_bytes, value) in pairs {
        buf.extend_from_slice(&key_bytes);
        encode_value_to(buf, value)?;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Shape helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Build an unsigned integer value.
pub fn uint(n: u64) -> Value {
    Value::Integer(n.into())
}

/// Wrap already-encoded bytes as `#6.24(bytes)`.
pub fn wrap_encoded(bytes: &[u8]) -> Value {
    Value::Tag(TAG_ENCODED_CBOR, Box::new(Value::Bytes(bytes.to_vec())))
}

/// Take an array value.
pub fn as_array(value: Value, context: &'static str) -> Result<Vec<Value>, CodecError> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(CodecError::structure(
            context,
            format!("expected array, got {}", kind(&other)),
        )),
    }
}

/// Take an array value of exactly `len` items.
pub fn as_array_of(
    value: Value,
    len: usize,
    context: &'static str,
) -> Result<Vec<Value>, CodecError> {
    let items = as_array(value, context)?;
    if items.len() != len {
        return Err(CodecError::structure(
            context,
            format!("expected {} items, got {}", len, items.len()),
        ));
    }
    Ok(items)
}

/// Read an unsigned integer.
pub fn as_u64(value: &Value, context: &'static str) -> Result<u64, CodecError> {
    match value {
        Value::Integer(i) => u64::try_from(*i)
            .map_err(|_| CodecError::structure(context, "integer out of u64 range")),
        other => Err(CodecError::structure(
            context,
            format!("expected unsigned integer, got {}", kind(other)),
        )),
    }
}

/// Read a boolean.
pub fn as_bool(value: &Value, context: &'static str) -> Result<bool, CodecError> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(CodecError::structure(
            context,
            format!("expected bool, got {}", kind(other)),
        )),
    }
}

/// Take a byte string.
pub fn as_bytes(value: Value, context: &'static str) -> Result<Vec<u8>, CodecError> {
    match value {
        Value::Bytes(b) => Ok(b),
        other => Err(CodecError::structure(
            context,
            format!("expected bytes, got {}", kind(&other)),
        )),
    }
}

/// Take a text string.
pub fn as_text(value: Value, context: &'static str) -> Result<String, CodecError> {
    match value {
        Value::Text(s) => Ok(s),
        other => Err(CodecError::structure(
            context,
            format!("expected text, got {}", kind(&other)),
        )),
    }
}

/// Unwrap `#6.24(bytes)` into the embedded bytes.
pub fn as_wrapped(value: Value, context: &'static str) -> Result<Vec<u8>, CodecError> {
    match value {
        Value::Tag(TAG_ENCODED_CBOR, inner) => as_bytes(*inner, context),
        other => Err(CodecError::structure(
            context,
            format!("expected tag 24, got {}", kind(&other)),
        )),
    }
}

/// Split a `[tag, fields...]` message array into its tag and fields.
pub fn split_message(
    value: Value,
    protocol: &'static str,
) -> Result<(u64, Vec<Value>), CodecError> {
    let mut items = as_array(value, protocol)?;
    if items.is_empty() {
        return Err(CodecError::structure(protocol, "empty message array"));
    }
    let tag = as_u64(&items[0], protocol)?;
    items.remove(0);
    Ok((tag, items))
}

/// Check the field count of a message.
pub fn expect_fields(
    fields: &[Value],
    len: usize,
    context: &'static str,
) -> Result<(), CodecError> {
    if fields.len() != len {
        return Err(CodecError::structure(
            context,
            format!("expected {} fields, got {}", len, fields.len()),
        ));
    }
    Ok(())
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Integer(_) => "integer",
        Value::Bytes(_) => "bytes",
        Value::Float(_) => "float",
        Value::Text(_) => "text",
        Value::Bool(_) => "bool",
        Value::Null => "null",
        Value::Tag(..) => "tag",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
        _ => "unknown",
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Point / Tip wire forms
// ─────────────────────────────────────────────────────────────────────────────

impl Point {
    /// `[]` for the origin, `[slot, hash]` otherwise.
    pub fn to_cbor(&self) -> Value {
        match &self.hash {
            None => Value::Array(vec![]),
            Some(hash) => Value::Array(vec![uint(self.slot), Value::Bytes(hash.0.to_vec())]),
        }
    }

    pub fn from_cbor(value: Value) -> Result<Self, CodecError> {
        let items = as_array(value, "point")?;
        match items.len() {
            0 => Ok(Point::ORIGIN),
            2 => {
                let mut items = items.into_iter();
                let slot = as_u64(&items.next().unwrap_or(Value::Null), "point.slot")?;
                let raw = as_bytes(items.next().unwrap_or(Value::Null), "point.hash")?;
                let hash = BlockHash::try_from(raw.as_slice())
                    .map_err(|_| CodecError::structure("point.hash", "expected 32 bytes"))?;
                Ok(Point::new(slot, hash))
            }
            n => Err(CodecError::structure(
                "point",
                format!("expected 0 or 2 items, got {}", n),
            )),
        }
    }
}

impl Tip {
    /// `[point, block_number]`.
    pub fn to_cbor(&self) -> Value {
        Value::Array(vec![self.point.to_cbor(), uint(self.block_number)])
    }

    pub fn from_cbor(value: Value) -> Result<Self, CodecError> {
        let mut items = as_array_of(value, 2, "tip")?.into_iter();
        let point = Point::from_cbor(items.next().unwrap_or(Value::Null))?;
        let block_number = as_u64(&items.next().unwrap_or(Value::Null), "tip.block_number")?;
        Ok(Tip::new(point, block_number))
    }
}
