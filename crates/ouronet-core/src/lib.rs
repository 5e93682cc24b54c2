//! # ouronet core
//!
//! Pure value types shared by every ouronet crate: chain points, tips,
//! header content and the deterministic CBOR layer the wire codecs use.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`Point`] - A `(slot, hash)` position on the chain; [`Point::ORIGIN`] has no hash
//! - [`Tip`] - The head of a chain as reported by a peer
//! - [`BlockHash`] - 32-byte digest newtype
//! - [`HeaderContent`] - Era-tagged header (or block) bytes carried by chain-sync
//!
//! ## Encoding
//!
//! Everything that goes on the wire is deterministic CBOR. See [`cbor`].

pub mod cbor;
pub mod error;
pub mod header;
pub mod types;

pub use error::CodecError;
pub use header::{HeaderContent, BYRON_EPOCH_SLOTS};
pub use types::{BlockHash, Point, Tip};

/// Re-exported so codecs in other crates share one `Value` type.
pub use ciborium::value::Value as CborValue;
