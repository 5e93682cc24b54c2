//! Error types for ouronet core.

use thiserror::Error;

/// Errors raised while encoding or decoding wire values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Bytes are not valid CBOR.
    #[error("malformed cbor: {0}")]
    Malformed(String),

    /// Input ended before a complete item was read.
    #[error("truncated input")]
    Truncated,

    /// A complete item was read but bytes were left over.
    #[error("{0} trailing bytes after item")]
    TrailingBytes(usize),

    /// The CBOR item does not have the expected shape.
    #[error("unexpected structure in {context}: {detail}")]
    Structure {
        context: &'static str,
        detail: String,
    },

    /// Message tag not defined for this protocol.
    #[error("unknown {protocol} message tag {tag}")]
    UnknownTag { protocol: &'static str, tag: u64 },

    /// Value cannot be represented on the wire.
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl CodecError {
    pub fn structure(context: &'static str, detail: impl Into<String>) -> Self {
        CodecError::Structure {
            context,
            detail: detail.into(),
        }
    }
}
