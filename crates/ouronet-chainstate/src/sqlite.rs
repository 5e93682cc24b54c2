//! SQLite implementation of the ChainState trait.
//!
//! The persistent backend for servers that keep their chain on disk. The
//! connection sits behind a mutex; every query is a short indexed lookup.

use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};

use ouronet_core::{BlockHash, Point, Tip};

use crate::error::{ChainStateError, Result};
use crate::migration;
use crate::traits::{AppendResult, ChainState, ChainStore, StoredBlock};

/// SQLite-based chain state.
pub struct SqliteChainState {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteChainState {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| ChainStateError::Unavailable(format!("mutex poisoned: {}", e)))?;
        f(&mut conn)
    }
}

fn row_to_point(row: &rusqlite::Row<'_>) -> rusqlite::Result<Point> {
    let slot: u64 = row.get("slot")?;
    let hash_bytes: Vec<u8> = row.get("hash")?;
    let hash = BlockHash::try_from(hash_bytes.as_slice()).map_err(|_| {
        rusqlite::Error::InvalidColumnType(1, "hash".into(), rusqlite::types::Type::Blob)
    })?;
    Ok(Point::new(slot, hash))
}

/// Slot of `point` if it is on the chain.
fn lookup(conn: &Connection, point: &Point) -> Result<Option<u64>> {
    let Some(hash) = point.hash else {
        return Ok(None);
    };
    let slot = conn
        .query_row(
            "SELECT slot FROM blocks WHERE slot = ?1 AND hash = ?2",
            params![point.slot, &hash.0[..]],
            |row| row.get::<_, u64>(0),
        )
        .optional()?;
    Ok(slot)
}

impl ChainState for SqliteChainState {
    fn has_point(&self, point: &Point) -> Result<bool> {
        self.with_conn(|conn| Ok(lookup(conn, point)?.is_some()))
    }

    fn find_next_block(&self, after: &Point) -> Result<Option<Point>> {
        self.with_conn(|conn| {
            let from_slot = if after.is_origin() {
                None
            } else {
                match lookup(conn, after)? {
                    Some(slot) => Some(slot),
                    None => return Ok(None),
                }
            };

            let next = match from_slot {
                None => conn
                    .query_row(
                        "SELECT slot, hash FROM blocks ORDER BY slot ASC LIMIT 1",
                        [],
                        row_to_point,
                    )
                    .optional()?,
                Some(slot) => conn
                    .query_row(
                        "SELECT slot, hash FROM blocks WHERE slot > ?1 ORDER BY slot ASC LIMIT 1",
                        params![slot],
                        row_to_point,
                    )
                    .optional()?,
            };
            Ok(next)
        })
    }

    fn get_block_header(&self, hash: &BlockHash) -> Result<Option<Bytes>> {
        self.with_conn(|conn| {
            let header = conn
                .query_row(
                    "SELECT header FROM blocks WHERE hash = ?1",
                    params![&hash.0[..]],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?;
            Ok(header.map(Bytes::from))
        })
    }

    fn get_block(&self, hash: &BlockHash) -> Result<Option<Bytes>> {
        self.with_conn(|conn| {
            let body = conn
                .query_row(
                    "SELECT body FROM blocks WHERE hash = ?1",
                    params![&hash.0[..]],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?;
            Ok(body.map(Bytes::from))
        })
    }

    fn get_tip(&self) -> Result<Option<Tip>> {
        self.with_conn(|conn| {
            let tip = conn
                .query_row(
                    "SELECT slot, hash, block_number FROM blocks ORDER BY slot DESC LIMIT 1",
                    [],
                    |row| Ok(Tip::new(row_to_point(row)?, row.get("block_number")?)),
                )
                .optional()?;
            Ok(tip)
        })
    }
}

impl ChainStore for SqliteChainState {
    fn append_block(&self, block: StoredBlock) -> Result<AppendResult> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            if lookup(&tx, &block.point)?.is_some() {
                return Ok(AppendResult::AlreadyExists);
            }

            let tip_slot: Option<u64> = tx
                .query_row("SELECT MAX(slot) FROM blocks", [], |row| row.get(0))
                .optional()?
                .flatten();
            if let Some(tip_slot) = tip_slot {
                if block.point.slot <= tip_slot {
                    return Err(ChainStateError::NotExtending {
                        slot: block.point.slot,
                        tip_slot,
                    });
                }
            }

            tx.execute(
                "INSERT INTO blocks (slot, hash, block_number, header, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    block.point.slot,
                    &block.hash().0[..],
                    block.block_number,
                    &block.header[..],
                    &block.body[..],
                ],
            )?;
            tx.commit()?;

            Ok(AppendResult::Appended)
        })
    }

    fn rollback_to(&self, point: &Point) -> Result<usize> {
        self.with_conn(|conn| {
            let removed = if point.is_origin() {
                conn.execute("DELETE FROM blocks", [])?
            } else {
                let slot = lookup(conn, point)?.ok_or(ChainStateError::NotFound(*point))?;
                conn.execute("DELETE FROM blocks WHERE slot > ?1", params![slot])?
            };

            tracing::debug!(to = %point, removed, "sqlite chain rolled back");
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(slot: u64, block_number: u64) -> StoredBlock {
        StoredBlock {
            point: Point::new(slot, BlockHash::digest(&slot.to_be_bytes())),
            block_number,
            header: Bytes::from(vec![0x80]),
            body: Bytes::from(vec![block_number as u8; 4]),
        }
    }

    #[test]
    fn test_append_and_tip() {
        let chain = SqliteChainState::open_memory().unwrap();
        assert!(chain.get_tip().unwrap().is_none());

        chain.append_block(block(5, 1)).unwrap();
        chain.append_block(block(9, 2)).unwrap();

        let tip = chain.get_tip().unwrap().unwrap();
        assert_eq!(tip, block(9, 2).tip());
    }

    #[test]
    fn test_idempotent_append() {
        let chain = SqliteChainState::open_memory().unwrap();
        assert_eq!(chain.append_block(block(5, 1)).unwrap(), AppendResult::Appended);
        assert_eq!(
            chain.append_block(block(5, 1)).unwrap(),
            AppendResult::AlreadyExists
        );
    }

    #[test]
    fn test_find_next_and_rollback() {
        let chain = SqliteChainState::open_memory().unwrap();
        for (i, slot) in [5u64, 9, 14].iter().enumerate() {
            chain.append_block(block(*slot, i as u64 + 1)).unwrap();
        }

        assert_eq!(chain.find_next_block(&Point::ORIGIN).unwrap(), Some(block(5, 1).point));
        assert_eq!(chain.find_next_block(&block(9, 2).point).unwrap(), Some(block(14, 3).point));

        assert_eq!(chain.rollback_to(&block(5, 1).point).unwrap(), 2);
        assert!(!chain.has_point(&block(9, 2).point).unwrap());
        assert_eq!(chain.find_next_block(&block(9, 2).point).unwrap(), None);
    }

    #[test]
    fn test_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.db");

        {
            let chain = SqliteChainState::open(&path).unwrap();
            chain.append_block(block(5, 1)).unwrap();
        }

        let chain = SqliteChainState::open(&path).unwrap();
        assert!(chain.has_point(&block(5, 1).point).unwrap());
        assert_eq!(
            chain.get_block(&block(5, 1).hash()).unwrap(),
            Some(block(5, 1).body)
        );
    }
}
