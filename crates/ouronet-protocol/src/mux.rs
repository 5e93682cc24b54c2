//! Segment framing and per-protocol reassembly.
//!
//! Every mini-protocol shares one byte stream. Outbound messages are cut
//! into segments with an 8-byte header:
//!
//! ```text
//!  0               4       6       8
//!  +---------------+-------+-------+----------------
//!  | timestamp u32 | M|id  | len   | payload (len bytes)
//!  +---------------+-------+-------+----------------
//! ```
//!
//! All fields are big-endian. `M` is the top bit of the protocol word:
//! 0 for the initiator, 1 for the responder. A message may span many
//! segments and one segment may carry the tail of a message followed by
//! the start of the next; the [`Demuxer`] reassembles messages per
//! `(protocol, mode)` channel using CBOR item boundaries.

use std::collections::HashMap;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ouronet_core::cbor;

use crate::error::MuxError;

/// Segment header size in bytes.
pub const SEGMENT_HEADER_LEN: usize = 8;

/// Largest payload a single segment can carry.
pub const MAX_SEGMENT_PAYLOAD: usize = u16::MAX as usize;

/// Default cap on one reassembled message.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 4 * 1024 * 1024;

const MODE_BIT: u16 = 0x8000;

/// Mini-protocol number carried in the segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolId(pub u16);

impl ProtocolId {
    pub const HANDSHAKE: Self = Self(0);
    pub const CHAIN_SYNC: Self = Self(2);
    pub const BLOCK_FETCH: Self = Self(3);
    pub const LOCAL_CHAIN_SYNC: Self = Self(5);
    pub const KEEP_ALIVE: Self = Self(8);
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which end of the connection sent a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Initiator,
    Responder,
}

/// One framed unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub timestamp: u32,
    pub protocol: ProtocolId,
    pub mode: Mode,
    pub payload: Bytes,
}

impl Segment {
    /// Append the encoded segment to `dst`.
    ///
    /// The payload must fit in one segment.
    pub fn encode(&self, dst: &mut BytesMut) {
        debug_assert!(self.payload.len() <= MAX_SEGMENT_PAYLOAD);
        put_header(dst, self.timestamp, self.protocol, self.mode, self.payload.len());
        dst.extend_from_slice(&self.payload);
    }

    /// Parse one segment from the front of `src`.
    ///
    /// Returns `None` and leaves `src` untouched when the segment is not
    /// complete yet.
    pub fn decode(src: &mut BytesMut) -> Option<Segment> {
        if src.len() < SEGMENT_HEADER_LEN {
            return None;
        }
        let len = u16::from_be_bytes([src[6], src[7]]) as usize;
        if src.len() < SEGMENT_HEADER_LEN + len {
            return None;
        }

        let timestamp = src.get_u32();
        let word = src.get_u16();
        src.advance(2);
        let payload = src.split_to(len).freeze();

        Some(Segment {
            timestamp,
            protocol: ProtocolId(word & !MODE_BIT),
            mode: if word & MODE_BIT == 0 {
                Mode::Initiator
            } else {
                Mode::Responder
            },
            payload,
        })
    }
}

fn put_header(dst: &mut BytesMut, timestamp: u32, protocol: ProtocolId, mode: Mode, len: usize) {
    let mode_bit = match mode {
        Mode::Initiator => 0,
        Mode::Responder => MODE_BIT,
    };
    dst.reserve(SEGMENT_HEADER_LEN + len);
    dst.put_u32(timestamp);
    dst.put_u16((protocol.0 & !MODE_BIT) | mode_bit);
    dst.put_u16(len as u16);
}

/// Split one encoded message into as many segments as it needs.
///
/// An empty message still produces one empty segment.
pub fn write_message(
    dst: &mut BytesMut,
    timestamp: u32,
    protocol: ProtocolId,
    mode: Mode,
    message: &[u8],
) {
    if message.is_empty() {
        put_header(dst, timestamp, protocol, mode, 0);
        return;
    }
    for chunk in message.chunks(MAX_SEGMENT_PAYLOAD) {
        put_header(dst, timestamp, protocol, mode, chunk.len());
        dst.extend_from_slice(chunk);
    }
}

/// A complete message reassembled from one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub protocol: ProtocolId,
    pub mode: Mode,
    pub payload: Bytes,
}

/// Incremental segment parser and message reassembler.
///
/// Feed it raw bytes in whatever fragments the transport delivers; it
/// yields every message completed by those bytes, in arrival order.
pub struct Demuxer {
    pending: BytesMut,
    channels: HashMap<(ProtocolId, Mode), BytesMut>,
    max_message_len: usize,
}

impl Demuxer {
    pub fn new(max_message_len: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            channels: HashMap::new(),
            max_message_len,
        }
    }

    /// Consume `bytes` and return every message it completes.
    ///
    /// A channel whose buffered bytes turn out to be malformed, or grow
    /// past the message limit, is cleared and reported as an error; other
    /// channels are unaffected.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<Inbound, MuxError>> {
        self.pending.extend_from_slice(bytes);

        let mut out = Vec::new();
        while let Some(segment) = Segment::decode(&mut self.pending) {
            let key = (segment.protocol, segment.mode);
            let buffer = self.channels.entry(key).or_default();
            buffer.extend_from_slice(&segment.payload);
            Self::drain_channel(key, buffer, self.max_message_len, &mut out);
        }
        out
    }

    /// Bytes buffered on a channel waiting for the rest of a message.
    pub fn buffered(&self, protocol: ProtocolId, mode: Mode) -> usize {
        self.channels.get(&(protocol, mode)).map_or(0, BytesMut::len)
    }

    fn drain_channel(
        (protocol, mode): (ProtocolId, Mode),
        buffer: &mut BytesMut,
        limit: usize,
        out: &mut Vec<Result<Inbound, MuxError>>,
    ) {
        loop {
            match cbor::decode_prefix(&buffer[..]) {
                Ok(Some((_, used))) => {
                    let payload = buffer.split_to(used).freeze();
                    out.push(Ok(Inbound {
                        protocol,
                        mode,
                        payload,
                    }));
                }
                Ok(None) => {
                    if buffer.len() > limit {
                        buffer.clear();
                        out.push(Err(MuxError::MessageTooLarge {
                            protocol,
                            mode,
                            limit,
                        }));
                    }
                    return;
                }
                Err(source) => {
                    buffer.clear();
                    out.push(Err(MuxError::Malformed {
                        protocol,
                        mode,
                        source,
                    }));
                    return;
                }
            }
        }
    }
}

impl Default for Demuxer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_LEN)
    }
}
