//! # ouronet
//!
//! Client and server engine for the Ouroboros mini-protocols: handshake,
//! chain-sync, block-fetch and keep-alive over one multiplexed connection.
//!
//! ## Overview
//!
//! - **[`NodeClient`]**: connects to a peer, negotiates a version, follows
//!   its chain and reconnects when the connection drops
//! - **[`NodeServer`]**: serves a [`ChainState`](chainstate::ChainState) to
//!   every peer that connects and pushes new blocks to waiting clients
//! - **[`telemetry`]**: explicit tracing bootstrap for processes
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ouronet::{NodeClient, NodeConfig, Endpoint};
//! use ouronet::core::{Point, Tip};
//! use ouronet::protocol::{ChainSyncClient, ChainSyncListener};
//!
//! struct Printer;
//!
//! impl ChainSyncListener for Printer {
//!     fn roll_backward(&self, point: &Point, tip: &Tip) {
//!         println!("rolled back to {} (tip {})", point, tip);
//!     }
//! }
//!
//! async fn example() -> ouronet::Result<()> {
//!     ouronet::telemetry::init("info").ok();
//!
//!     let config = NodeConfig::new(Endpoint::tcp("relay.example", 3001), ouronet::MAINNET_MAGIC);
//!     let mut chain_sync = ChainSyncClient::from_tip();
//!     chain_sync.add_listener(Arc::new(Printer))?;
//!
//!     let client = NodeClient::builder(config).chain_sync(chain_sync).build()?;
//!     client.start().await?;
//!     // ...
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `ouronet::core` - points, tips, headers, CBOR helpers
//! - `ouronet::chainstate` - chain-state contract and backends
//! - `ouronet::protocol` - agents, multiplexer, sessions, server loop

pub mod client;
pub mod config;
pub mod error;
pub mod server;
pub mod telemetry;

pub use ouronet_chainstate as chainstate;
pub use ouronet_core as core;
pub use ouronet_protocol as protocol;

pub use client::{NodeClient, NodeClientBuilder};
pub use config::{NodeConfig, MAINNET_MAGIC, PREPROD_MAGIC, PREVIEW_MAGIC};
pub use error::{NodeError, Result};
pub use server::{NodeServer, NodeServerBuilder};

pub use ouronet_protocol::{Endpoint, ServerConfig, SessionConfig, SessionListener, SessionState};
