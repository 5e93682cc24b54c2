//! Error types for chain-state backends.

use ouronet_core::{CodecError, Point};
use thiserror::Error;

/// Errors that can occur during chain-state operations.
#[derive(Debug, Error)]
pub enum ChainStateError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Stored header bytes could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Point is not on the current chain.
    #[error("point not on chain: {0}")]
    NotFound(Point),

    /// Block would not extend the current tip.
    #[error("block at slot {slot} does not extend tip at slot {tip_slot}")]
    NotExtending { slot: u64, tip_slot: u64 },

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Backend unavailable (lock poisoned, connection lost).
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Result type for chain-state operations.
pub type Result<T> = std::result::Result<T, ChainStateError>;
