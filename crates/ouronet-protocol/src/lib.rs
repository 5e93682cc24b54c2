//! # Ouronet Protocol
//!
//! Node-to-node and node-to-client mini-protocols over a multiplexed
//! byte stream.
//!
//! ## Overview
//!
//! Each mini-protocol is a state machine ([`Protocol`]) in which exactly
//! one side holds agency in every non-terminal state. An [`Agent`] plays
//! one role of one protocol: it produces messages when it holds agency
//! and reacts to messages when it does not. Agents are bound to a
//! [`Connection`], which frames their messages into segments and routes
//! inbound segments back by protocol id and direction.
//!
//! A [`Session`] drives the client side of one connection through
//! connect, handshake and reconnect. [`serve`] runs the server side for
//! every accepted stream.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ouronet_protocol::{
//!     AgentHandle, Endpoint, HandshakeAgent, KeepAliveClient, Session, SessionConfig,
//!     VersionTable,
//! };
//!
//! async fn example() -> Result<(), ouronet_protocol::SessionError> {
//!     let session = Session::new(
//!         Endpoint::tcp("relay.example", 3001),
//!         HandshakeAgent::client(VersionTable::node_to_node(764824073)),
//!         SessionConfig::default(),
//!     );
//!     let keep_alive = AgentHandle::new(KeepAliveClient::new());
//!     session.add_agent(keep_alive.clone())?;
//!     session.start().await?;
//!
//!     let cookie = keep_alive.with(|k| k.ping());
//!     println!("sent ping {}", cookie);
//!     Ok(())
//! }
//! ```
//!
//! ## Segment Layout
//!
//! ```text
//! 0               4       6       8
//! +---------------+-------+-------+------------------
//! | timestamp us  |M| id  |  len  | payload (len bytes)
//! +---------------+-------+-------+------------------
//! ```

pub mod agent;
pub mod blockfetch;
pub mod chainsync;
pub mod channel;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod keepalive;
pub mod mux;
pub mod server;
pub mod session;
pub mod transport;

pub use agent::{
    Agency, Agent, ListenerId, Listeners, Message, Notifications, Protocol, Role,
};
pub use blockfetch::{
    BlockFetch, BlockFetchClient, BlockFetchListener, BlockFetchMessage, BlockFetchServer,
    BlockFetchState,
};
pub use chainsync::{
    ChainSync, ChainSyncClient, ChainSyncListener, ChainSyncMessage, ChainSyncServer,
    ChainSyncState,
};
pub use channel::{AgentHandle, AgentPort, ChannelHandle, Router};
pub use connection::Connection;
pub use error::{AgentError, MuxError, ProtocolViolation, Result, SessionError};
pub use handshake::{
    HandshakeAgent, HandshakeListener, HandshakeMessage, HandshakeOutcome, ProposedVersions,
    RefuseReason, VersionData, VersionTable,
};
pub use keepalive::{KeepAliveClient, KeepAliveListener, KeepAliveMessage, KeepAliveServer};
pub use mux::{Demuxer, Mode, ProtocolId, Segment};
pub use server::{serve, AgentFactory, Server, ServerAgents, ServerConfig, ServerHandle};
pub use session::{Session, SessionConfig, SessionListener, SessionState};
pub use transport::{memory::MemoryNetwork, Acceptor, BoxedStream, Connector, Endpoint};
