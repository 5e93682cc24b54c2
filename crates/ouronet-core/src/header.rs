//! Header content carried by chain-sync `RollForward`.
//!
//! Header bytes are opaque to the engine except for the handful of fields
//! needed to derive the [`Point`] a header sits at:
//!
//! ```text
//! Shelley-family header   [[block_no, slot, ...], signature]
//! Byron main header       [magic, prev, proof, [[epoch, slot], ...], extra]
//! Byron boundary header   [magic, prev, proof, [epoch, difficulty], extra]
//! Block (node-to-client)  [era, [header, ...]]
//! ```

use bytes::Bytes;
use ciborium::value::Value;

use crate::cbor::{self, as_array, as_array_of, as_u64, as_wrapped, uint, wrap_encoded};
use crate::error::CodecError;
use crate::types::{BlockHash, Point};

/// Slots per epoch in the Byron era.
pub const BYRON_EPOCH_SLOTS: u64 = 21600;

const BYRON_BOUNDARY: u64 = 0;
const BYRON_MAIN: u64 = 1;

/// What a `RollForward` delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderContent {
    /// A post-Byron header, tagged with its hard-fork era index.
    Shelley { era: u64, bytes: Bytes },
    /// A Byron main-block header with its block size hint.
    ByronMain { size: u64, bytes: Bytes },
    /// A Byron epoch-boundary header with its block size hint.
    ByronBoundary { size: u64, bytes: Bytes },
    /// A whole block (node-to-client chain-sync).
    Block { bytes: Bytes },
}

impl HeaderContent {
    /// The opaque header (or block) bytes.
    pub fn raw(&self) -> &Bytes {
        match self {
            HeaderContent::Shelley { bytes, .. }
            | HeaderContent::ByronMain { bytes, .. }
            | HeaderContent::ByronBoundary { bytes, .. }
            | HeaderContent::Block { bytes } => bytes,
        }
    }

    pub fn to_cbor(&self) -> Value {
        match self {
            HeaderContent::Shelley { era, bytes } => {
                Value::Array(vec![uint(*era), wrap_encoded(bytes)])
            }
            HeaderContent::ByronMain { size, bytes } => byron_to_cbor(BYRON_MAIN, *size, bytes),
            HeaderContent::ByronBoundary { size, bytes } => {
                byron_to_cbor(BYRON_BOUNDARY, *size, bytes)
            }
            HeaderContent::Block { bytes } => wrap_encoded(bytes),
        }
    }

    pub fn from_cbor(value: Value) -> Result<Self, CodecError> {
        if let Value::Tag(..) = value {
            let bytes = as_wrapped(value, "block")?;
            return Ok(HeaderContent::Block {
                bytes: Bytes::from(bytes),
            });
        }

        let mut items = as_array_of(value, 2, "header")?.into_iter();
        let era = as_u64(&items.next().unwrap_or(Value::Null), "header.era")?;
        let body = items.next().unwrap_or(Value::Null);

        if era > 0 {
            let bytes = as_wrapped(body, "header.bytes")?;
            return Ok(HeaderContent::Shelley {
                era,
                bytes: Bytes::from(bytes),
            });
        }

        let mut byron = as_array_of(body, 2, "byron header")?.into_iter();
        let prefix = as_array_of(byron.next().unwrap_or(Value::Null), 2, "byron prefix")?;
        let variant = as_u64(&prefix[0], "byron variant")?;
        let size = as_u64(&prefix[1], "byron size")?;
        let bytes = Bytes::from(as_wrapped(
            byron.next().unwrap_or(Value::Null),
            "byron bytes",
        )?);

        match variant {
            BYRON_BOUNDARY => Ok(HeaderContent::ByronBoundary { size, bytes }),
            BYRON_MAIN => Ok(HeaderContent::ByronMain { size, bytes }),
            other => Err(CodecError::structure(
                "byron variant",
                format!("unknown variant {}", other),
            )),
        }
    }

    /// Encode as stored by chain-state backends.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        cbor::encode(&self.to_cbor())
    }

    /// Decode from chain-state storage bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Self::from_cbor(cbor::decode(bytes)?)
    }

    /// Hash identifying the block this header belongs to.
    pub fn hash(&self) -> Result<BlockHash, CodecError> {
        match self {
            HeaderContent::Block { bytes } => {
                let (_, header) = block_header(bytes)?;
                Ok(BlockHash::digest(&cbor::encode(&header)?))
            }
            other => Ok(BlockHash::digest(other.raw())),
        }
    }

    /// Absolute slot of the header.
    pub fn slot(&self) -> Result<u64, CodecError> {
        match self {
            HeaderContent::Shelley { bytes, .. } => shelley_slot(cbor::decode(bytes)?),
            HeaderContent::ByronMain { bytes, .. } => byron_main_slot(cbor::decode(bytes)?),
            HeaderContent::ByronBoundary { bytes, .. } => {
                byron_boundary_slot(cbor::decode(bytes)?)
            }
            HeaderContent::Block { bytes } => {
                let (era, header) = block_header(bytes)?;
                match era {
                    BYRON_BOUNDARY => byron_boundary_slot(header),
                    BYRON_MAIN => byron_main_slot(header),
                    _ => shelley_slot(header),
                }
            }
        }
    }

    /// The chain point this header sits at.
    pub fn point(&self) -> Result<Point, CodecError> {
        Ok(Point::new(self.slot()?, self.hash()?))
    }
}

fn byron_to_cbor(variant: u64, size: u64, bytes: &[u8]) -> Value {
    Value::Array(vec![
        uint(0),
        Value::Array(vec![
            Value::Array(vec![uint(variant), uint(size)]),
            wrap_encoded(bytes),
        ]),
    ])
}

/// Split `[era, [header, ...]]` into the era and the header value.
fn block_header(bytes: &[u8]) -> Result<(u64, Value), CodecError> {
    let mut items = as_array_of(cbor::decode(bytes)?, 2, "block")?.into_iter();
    let era = as_u64(&items.next().unwrap_or(Value::Null), "block.era")?;
    let body = as_array(items.next().unwrap_or(Value::Null), "block.body")?;
    let header = body
        .into_iter()
        .next()
        .ok_or_else(|| CodecError::structure("block.body", "missing header"))?;
    Ok((era, header))
}

fn shelley_slot(header: Value) -> Result<u64, CodecError> {
    let header = as_array(header, "shelley header")?;
    let body = header
        .into_iter()
        .next()
        .ok_or_else(|| CodecError::structure("shelley header", "missing body"))?;
    let body = as_array(body, "shelley header body")?;
    let slot = body
        .get(1)
        .ok_or_else(|| CodecError::structure("shelley header body", "missing slot"))?;
    as_u64(slot, "shelley slot")
}

fn byron_main_slot(header: Value) -> Result<u64, CodecError> {
    let header = as_array(header, "byron header")?;
    let consensus = header
        .into_iter()
        .nth(3)
        .ok_or_else(|| CodecError::structure("byron header", "missing consensus data"))?;
    let slot_id = as_array(consensus, "byron consensus")?
        .into_iter()
        .next()
        .ok_or_else(|| CodecError::structure("byron consensus", "missing slot id"))?;
    let slot_id = as_array_of(slot_id, 2, "byron slot id")?;
    let epoch = as_u64(&slot_id[0], "byron epoch")?;
    let slot = as_u64(&slot_id[1], "byron slot")?;
    Ok(epoch * BYRON_EPOCH_SLOTS + slot)
}

fn byron_boundary_slot(header: Value) -> Result<u64, CodecError> {
    let header = as_array(header, "byron boundary header")?;
    let consensus = header
        .into_iter()
        .nth(3)
        .ok_or_else(|| CodecError::structure("byron boundary header", "missing consensus data"))?;
    let consensus = as_array(consensus, "byron boundary consensus")?;
    let epoch = consensus
        .first()
        .ok_or_else(|| CodecError::structure("byron boundary consensus", "missing epoch"))?;
    Ok(as_u64(epoch, "byron boundary epoch")? * BYRON_EPOCH_SLOTS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shelley_header_bytes(block_no: u64, slot: u64) -> Vec<u8> {
        let body = Value::Array(vec![uint(block_no), uint(slot), Value::Null]);
        cbor::encode(&Value::Array(vec![body, Value::Bytes(vec![0u8; 8])])).unwrap()
    }

    #[test]
    fn test_shelley_point() {
        let bytes = shelley_header_bytes(10, 4242);
        let content = HeaderContent::Shelley {
            era: 6,
            bytes: Bytes::from(bytes.clone()),
        };
        let point = content.point().unwrap();
        assert_eq!(point.slot, 4242);
        assert_eq!(point.hash, Some(BlockHash::digest(&bytes)));
    }

    #[test]
    fn test_byron_main_slot() {
        let consensus = Value::Array(vec![
            Value::Array(vec![uint(2), uint(15)]),
            Value::Bytes(vec![]),
        ]);
        let header = Value::Array(vec![
            uint(764824073),
            Value::Bytes(vec![0; 32]),
            Value::Null,
            consensus,
            Value::Null,
        ]);
        let content = HeaderContent::ByronMain {
            size: 100,
            bytes: Bytes::from(cbor::encode(&header).unwrap()),
        };
        assert_eq!(content.slot().unwrap(), 2 * BYRON_EPOCH_SLOTS + 15);
    }

    #[test]
    fn test_byron_boundary_slot() {
        let header = Value::Array(vec![
            uint(764824073),
            Value::Bytes(vec![0; 32]),
            Value::Null,
            Value::Array(vec![uint(3), Value::Array(vec![uint(0)])]),
            Value::Null,
        ]);
        let content = HeaderContent::ByronBoundary {
            size: 0,
            bytes: Bytes::from(cbor::encode(&header).unwrap()),
        };
        assert_eq!(content.slot().unwrap(), 3 * BYRON_EPOCH_SLOTS);
    }

    #[test]
    fn test_block_content_uses_embedded_header() {
        let header = cbor::decode(&shelley_header_bytes(1, 77)).unwrap();
        let block = Value::Array(vec![
            uint(6),
            Value::Array(vec![header.clone(), Value::Array(vec![])]),
        ]);
        let content = HeaderContent::Block {
            bytes: Bytes::from(cbor::encode(&block).unwrap()),
        };
        let point = content.point().unwrap();
        assert_eq!(point.slot, 77);
        assert_eq!(
            point.hash,
            Some(BlockHash::digest(&cbor::encode(&header).unwrap()))
        );
    }

    #[test]
    fn test_wire_forms_decode_to_same_variant() {
        let variants = vec![
            HeaderContent::Shelley {
                era: 2,
                bytes: Bytes::from_static(&[0x80]),
            },
            HeaderContent::ByronMain {
                size: 12,
                bytes: Bytes::from_static(&[0x80]),
            },
            HeaderContent::ByronBoundary {
                size: 3,
                bytes: Bytes::from_static(&[0x80]),
            },
            HeaderContent::Block {
                bytes: Bytes::from_static(&[0x80]),
            },
        ];
        for content in variants {
            let decoded = HeaderContent::decode(&content.encode().unwrap()).unwrap();
            assert_eq!(decoded, content);
        }
    }

    #[test]
    fn test_unparseable_header_has_no_slot() {
        let content = HeaderContent::Shelley {
            era: 3,
            bytes: Bytes::from_static(&[0x01]),
        };
        assert!(content.slot().is_err());
    }
}
