//! ChainState trait: the narrow query contract the protocol engine consumes.
//!
//! The engine never mutates chain state. Backends additionally implement
//! [`ChainStore`] so the surrounding node (and tests) can grow the chain and
//! simulate reorganisations.

use bytes::Bytes;
use ouronet_core::{BlockHash, CodecError, HeaderContent, Point, Tip};

use crate::error::Result;

/// A block as held by a chain-state backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    /// Where the block sits on the chain.
    pub point: Point,
    /// Height of the block.
    pub block_number: u64,
    /// Encoded [`HeaderContent`].
    pub header: Bytes,
    /// Opaque block body bytes served by block-fetch.
    pub body: Bytes,
}

impl StoredBlock {
    /// Build a stored block from header content, deriving its point.
    pub fn from_header(
        header: &HeaderContent,
        block_number: u64,
        body: impl Into<Bytes>,
    ) -> std::result::Result<Self, CodecError> {
        Ok(Self {
            point: header.point()?,
            block_number,
            header: Bytes::from(header.encode()?),
            body: body.into(),
        })
    }

    /// Hash of the block; every stored block has one.
    pub fn hash(&self) -> BlockHash {
        self.point.hash.unwrap_or(BlockHash::ZERO)
    }

    /// Tip describing this block.
    pub fn tip(&self) -> Tip {
        Tip::new(self.point, self.block_number)
    }
}

/// Result of appending a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// Block became the new tip.
    Appended,
    /// Block already on the chain (idempotent, not an error).
    AlreadyExists,
}

/// Read-only chain queries used by the chain-sync and block-fetch servers.
///
/// All methods are synchronous: they run on the connection's reader task
/// and must return quickly.
pub trait ChainState: Send + Sync {
    /// Whether `point` is on the current chain.
    ///
    /// The origin is not a block; callers treat it specially.
    fn has_point(&self, point: &Point) -> Result<bool>;

    /// The block following `after` on the current chain.
    ///
    /// `Point::ORIGIN` yields the first block. A point that is not on the
    /// chain, or the tip itself, yields `None`.
    fn find_next_block(&self, after: &Point) -> Result<Option<Point>>;

    /// Encoded [`HeaderContent`] of a block.
    fn get_block_header(&self, hash: &BlockHash) -> Result<Option<Bytes>>;

    /// Body bytes of a block.
    fn get_block(&self, hash: &BlockHash) -> Result<Option<Bytes>>;

    /// Current tip, `None` for an empty chain.
    fn get_tip(&self) -> Result<Option<Tip>>;
}

/// Mutations offered by backends to the surrounding system.
pub trait ChainStore: ChainState {
    /// Extend the chain by one block.
    ///
    /// The block's slot must be greater than the tip's slot.
    fn append_block(&self, block: StoredBlock) -> Result<AppendResult>;

    /// Drop every block after `point`; returns how many were removed.
    ///
    /// Rolling back to `Point::ORIGIN` empties the chain.
    fn rollback_to(&self, point: &Point) -> Result<usize>;
}
