//! In-memory implementation of the ChainState trait.
//!
//! Same semantics as SQLite with no persistence. Used by tests and by
//! servers that only need a short window of recent blocks.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use ouronet_core::{BlockHash, Point, Tip};

use crate::error::{ChainStateError, Result};
use crate::traits::{AppendResult, ChainState, ChainStore, StoredBlock};

/// In-memory chain.
///
/// Thread-safe via RwLock.
pub struct MemoryChainState {
    inner: RwLock<MemoryChainInner>,
}

#[derive(Default)]
struct MemoryChainInner {
    /// Blocks in chain order.
    blocks: Vec<StoredBlock>,

    /// Hash -> index into `blocks`.
    index: HashMap<BlockHash, usize>,
}

impl MemoryChainInner {
    fn position(&self, point: &Point) -> Option<usize> {
        let hash = point.hash?;
        let idx = *self.index.get(&hash)?;
        (self.blocks[idx].point.slot == point.slot).then_some(idx)
    }
}

impl MemoryChainState {
    /// Create a new empty chain.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryChainInner::default()),
        }
    }

    /// Number of blocks on the chain.
    pub fn len(&self) -> usize {
        self.read().map(|inner| inner.blocks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryChainInner>> {
        self.inner
            .read()
            .map_err(|e| ChainStateError::Unavailable(format!("lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryChainInner>> {
        self.inner
            .write()
            .map_err(|e| ChainStateError::Unavailable(format!("lock poisoned: {}", e)))
    }
}

impl Default for MemoryChainState {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainState for MemoryChainState {
    fn has_point(&self, point: &Point) -> Result<bool> {
        Ok(self.read()?.position(point).is_some())
    }

    fn find_next_block(&self, after: &Point) -> Result<Option<Point>> {
        let inner = self.read()?;

        let next = if after.is_origin() {
            0
        } else {
            match inner.position(after) {
                Some(idx) => idx + 1,
                None => return Ok(None),
            }
        };

        Ok(inner.blocks.get(next).map(|b| b.point))
    }

    fn get_block_header(&self, hash: &BlockHash) -> Result<Option<Bytes>> {
        let inner = self.read()?;
        Ok(inner
            .index
            .get(hash)
            .map(|&idx| inner.blocks[idx].header.clone()))
    }

    fn get_block(&self, hash: &BlockHash) -> Result<Option<Bytes>> {
        let inner = self.read()?;
        Ok(inner.index.get(hash).map(|&idx| inner.blocks[idx].body.clone()))
    }

    fn get_tip(&self) -> Result<Option<Tip>> {
        Ok(self.read()?.blocks.last().map(StoredBlock::tip))
    }
}

impl ChainStore for MemoryChainState {
    fn append_block(&self, block: StoredBlock) -> Result<AppendResult> {
        let mut inner = self.write()?;

        if inner.position(&block.point).is_some() {
            return Ok(AppendResult::AlreadyExists);
        }

        if let Some(tip) = inner.blocks.last() {
            if block.point.slot <= tip.point.slot {
                return Err(ChainStateError::NotExtending {
                    slot: block.point.slot,
                    tip_slot: tip.point.slot,
                });
            }
        }

        let idx = inner.blocks.len();
        inner.index.insert(block.hash(), idx);
        inner.blocks.push(block);

        Ok(AppendResult::Appended)
    }

    fn rollback_to(&self, point: &Point) -> Result<usize> {
        let mut inner = self.write()?;

        let keep = if point.is_origin() {
            0
        } else {
            inner
                .position(point)
                .map(|idx| idx + 1)
                .ok_or(ChainStateError::NotFound(*point))?
        };

        let removed: Vec<StoredBlock> = inner.blocks.drain(keep..).collect();
        for block in &removed {
            inner.index.remove(&block.hash());
        }

        tracing::debug!(to = %point, removed = removed.len(), "memory chain rolled back");
        Ok(removed.len())
    }
}
