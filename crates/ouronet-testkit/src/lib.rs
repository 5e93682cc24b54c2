//! # ouronet testkit
//!
//! Testing utilities for the ouronet workspace.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: deterministic synthetic chains, with forks, for driving servers
//! - **Generators**: proptest strategies for points, tips and protocol messages
//! - **Golden vectors**: wire-exact CBOR messages that every codec change must keep
//!
//! ## Golden Vectors
//!
//! ```rust
//! use ouronet_testkit::vectors::verify_all_vectors;
//!
//! for (name, ok, hex) in verify_all_vectors() {
//!     println!("{}: {} ({})", name, ok, hex);
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use ouronet_protocol::Message;
//! use ouronet_testkit::generators::chain_sync_message;
//!
//! proptest! {
//!     #[test]
//!     fn encoding_is_deterministic(message in chain_sync_message()) {
//!         prop_assert_eq!(message.encode().unwrap(), message.encode().unwrap());
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust
//! use ouronet_testkit::fixtures::ChainFixture;
//!
//! let main = ChainFixture::new().extend(10);
//! let fork = main.fork(7, 1).extend(4);
//! let chain = main.memory_chain();
//! # let _ = (fork, chain);
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{shelley_header, ChainFixture, FIXTURE_ERA, SLOT_SPACING};
pub use generators::{chain_sync_message, fragment, point, tip};
pub use vectors::{all_vectors, reencode, verify_all_vectors, GoldenVector};
