//! Strong type definitions for chain positions.
//!
//! All identifiers are newtypes to prevent misuse at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte block hash.
///
/// Synthetic chains in this workspace hash header bytes with Blake3; the
/// engine itself treats the digest as opaque.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// Create a new BlockHash from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary bytes (usually encoded header bytes).
    pub fn digest(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// The zero hash (used as a sentinel).
    pub const ZERO: Self = Self([0u8; 32]);
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for BlockHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for BlockHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for BlockHash {
    type Error = std::array::TryFromSliceError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; 32] = slice.try_into()?;
        Ok(Self(arr))
    }
}

/// A position on the chain.
///
/// `Point::ORIGIN` (slot 0, no hash) stands for "before the first block" and
/// is considered present on every chain that holds data.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    /// Absolute slot number.
    pub slot: u64,
    /// Header hash of the block at `slot`, absent only for the origin.
    pub hash: Option<BlockHash>,
}

impl Point {
    /// The distinguished origin point.
    pub const ORIGIN: Self = Self {
        slot: 0,
        hash: None,
    };

    /// A point on a concrete block.
    pub const fn new(slot: u64, hash: BlockHash) -> Self {
        Self {
            slot,
            hash: Some(hash),
        }
    }

    /// True for slot 0 without a hash.
    pub fn is_origin(&self) -> bool {
        self.slot == 0 && self.hash.is_none()
    }
}

impl Default for Point {
    fn default() -> Self {
        Self::ORIGIN
    }
}

impl fmt::Debug for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Point({})", self)
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hash {
            None if self.slot == 0 => write!(f, "origin"),
            None => write!(f, "{}@-", self.slot),
            Some(hash) => write!(f, "{}@{}", self.slot, hash),
        }
    }
}

/// The head of a chain as reported by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tip {
    /// Point of the head block.
    pub point: Point,
    /// Height of the head block.
    pub block_number: u64,
}

impl Tip {
    /// Tip of an empty chain.
    pub const ORIGIN: Self = Self {
        point: Point::ORIGIN,
        block_number: 0,
    };

    pub const fn new(point: Point, block_number: u64) -> Self {
        Self {
            point,
            block_number,
        }
    }
}

impl fmt::Display for Tip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.point, self.block_number)
    }
}
