//! Synthetic chains for integration tests.
//!
//! Headers use the Shelley-family layout `[[block_no, slot, prev], sig]`
//! and bodies the node-to-client block layout `[era, [header, txs]]`, so
//! the same fixture drives header sync, block sync and block-fetch.

use std::sync::Arc;

use bytes::Bytes;
use ouronet_chainstate::{ChainStore, MemoryChainState, Result as ChainResult, StoredBlock};
use ouronet_core::cbor::{self, uint};
use ouronet_core::{CborValue, HeaderContent, Point, Tip};

/// Era index used for fixture headers (Babbage).
pub const FIXTURE_ERA: u64 = 6;

/// Slots between consecutive fixture blocks.
pub const SLOT_SPACING: u64 = 20;

/// A deterministic chain of fixture blocks.
///
/// Two fixtures with the same salt produce identical blocks; a different
/// salt gives different hashes at the same slots, which is how forks are
/// built.
#[derive(Debug, Clone)]
pub struct ChainFixture {
    blocks: Vec<StoredBlock>,
    salt: u8,
}

impl ChainFixture {
    pub fn new() -> Self {
        Self::with_salt(0)
    }

    pub fn with_salt(salt: u8) -> Self {
        Self {
            blocks: Vec::new(),
            salt,
        }
    }

    /// Append `count` blocks.
    pub fn extend(mut self, count: usize) -> Self {
        for _ in 0..count {
            self.push();
        }
        self
    }

    /// Append one block and return it.
    pub fn push(&mut self) -> StoredBlock {
        let block_number = self.blocks.len() as u64 + 1;
        let slot = block_number * SLOT_SPACING;
        let prev = self.blocks.last().map(|b| b.hash().0.to_vec());
        let block = make_block(block_number, slot, prev, self.salt);
        self.blocks.push(block.clone());
        block
    }

    /// Keep the first `keep` blocks and continue with a new salt.
    ///
    /// Blocks added to the result diverge from this fixture after `keep`.
    pub fn fork(&self, keep: usize, salt: u8) -> Self {
        Self {
            blocks: self.blocks[..keep.min(self.blocks.len())].to_vec(),
            salt,
        }
    }

    pub fn blocks(&self) -> &[StoredBlock] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn points(&self) -> Vec<Point> {
        self.blocks.iter().map(|b| b.point).collect()
    }

    /// Point of the `index`th block (0-based).
    pub fn point(&self, index: usize) -> Point {
        self.blocks[index].point
    }

    pub fn tip(&self) -> Tip {
        self.blocks.last().map(StoredBlock::tip).unwrap_or(Tip::ORIGIN)
    }

    /// Append every block to `store`, skipping ones already there.
    pub fn load_into(&self, store: &dyn ChainStore) -> ChainResult<()> {
        for block in &self.blocks {
            store.append_block(block.clone())?;
        }
        Ok(())
    }

    /// A fresh in-memory chain holding this fixture.
    pub fn memory_chain(&self) -> Arc<MemoryChainState> {
        let chain = Arc::new(MemoryChainState::new());
        for block in &self.blocks {
            // Fixture blocks always extend.
            let _ = chain.append_block(block.clone());
        }
        chain
    }
}

impl Default for ChainFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Header content for a fixture block.
pub fn shelley_header(
    block_number: u64,
    slot: u64,
    prev: Option<Vec<u8>>,
    salt: u8,
) -> HeaderContent {
    HeaderContent::Shelley {
        era: FIXTURE_ERA,
        bytes: Bytes::from(header_bytes(block_number, slot, prev, salt)),
    }
}

fn header_value(block_number: u64, slot: u64, prev: Option<Vec<u8>>, salt: u8) -> CborValue {
    let prev = prev.map(CborValue::Bytes).unwrap_or(CborValue::Null);
    let body = CborValue::Array(vec![uint(block_number), uint(slot), prev]);
    CborValue::Array(vec![body, CborValue::Bytes(vec![salt; 8])])
}

fn header_bytes(block_number: u64, slot: u64, prev: Option<Vec<u8>>, salt: u8) -> Vec<u8> {
    // Plain arrays, bytes and small integers always encode.
    cbor::encode(&header_value(block_number, slot, prev, salt)).unwrap_or_default()
}

fn make_block(block_number: u64, slot: u64, prev: Option<Vec<u8>>, salt: u8) -> StoredBlock {
    let header = header_value(block_number, slot, prev.clone(), salt);
    let txs = CborValue::Array(vec![CborValue::Bytes(
        format!("tx {} {}", block_number, salt).into_bytes(),
    )]);
    let body = CborValue::Array(vec![uint(FIXTURE_ERA), CborValue::Array(vec![header, txs])]);

    let content = shelley_header(block_number, slot, prev, salt);
    StoredBlock {
        point: content.point().unwrap_or(Point::ORIGIN),
        block_number,
        header: Bytes::from(content.encode().unwrap_or_default()),
        body: Bytes::from(cbor::encode(&body).unwrap_or_default()),
    }
}
