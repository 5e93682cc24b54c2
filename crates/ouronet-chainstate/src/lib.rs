//! # ouronet chain state
//!
//! The chain-state collaborator consumed by the chain-sync and block-fetch
//! servers, behind the [`ChainState`] trait, with an in-memory and a SQLite
//! backend.
//!
//! ## Key Types
//!
//! - [`ChainState`] - Read-only query contract (`has_point`, `find_next_block`, ...)
//! - [`ChainStore`] - Mutations for the surrounding node (`append_block`, `rollback_to`)
//! - [`MemoryChainState`] - In-memory chain for tests
//! - [`SqliteChainState`] - SQLite-based persistent chain
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ouronet_chainstate::{ChainState, SqliteChainState};
//! use ouronet_core::Point;
//!
//! let chain = SqliteChainState::open("chain.db").unwrap();
//! let first = chain.find_next_block(&Point::ORIGIN).unwrap();
//! ```

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{ChainStateError, Result};
pub use memory::MemoryChainState;
pub use sqlite::SqliteChainState;
pub use traits::{AppendResult, ChainState, ChainStore, StoredBlock};
