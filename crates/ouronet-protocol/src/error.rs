//! Error types for the protocol engine.

use std::time::Duration;

use ouronet_core::CodecError;
use thiserror::Error;

use crate::handshake::RefuseReason;
use crate::mux::{Mode, ProtocolId};

/// A message that the protocol state machine does not allow.
///
/// Raised when an inbound message arrives while the local side holds
/// agency, or when the message has no transition from the current state.
/// A violating message is dropped: no transition, no callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// The local side holds agency; the peer must not send.
    #[error("{protocol}: received {message} while holding agency in state {state}")]
    LocalAgency {
        protocol: &'static str,
        state: String,
        message: &'static str,
    },

    /// The protocol has terminated.
    #[error("{protocol}: received {message} after termination")]
    Terminated {
        protocol: &'static str,
        message: &'static str,
    },

    /// No transition for this message from the current state.
    #[error("{protocol}: {message} is not valid in state {state}")]
    InvalidTransition {
        protocol: &'static str,
        state: String,
        message: &'static str,
    },
}

/// Errors raised by agents and their bindings.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Listeners can only be registered before the session starts.
    #[error("listener registry is sealed")]
    ListenersSealed,

    /// The agent already has a channel for this connection.
    #[error("agent {0} is already bound to a connection")]
    AlreadyBound(&'static str),

    /// The connection's outbound queue is gone.
    #[error("channel closed")]
    ChannelClosed,

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("protocol violation: {0}")]
    Violation(#[from] ProtocolViolation),
}

/// Errors raised while framing or deframing segments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxError {
    /// A channel buffered more bytes than one message may take.
    #[error("message on protocol {protocol} ({mode:?}) exceeds {limit} bytes")]
    MessageTooLarge {
        protocol: ProtocolId,
        mode: Mode,
        limit: usize,
    },

    /// A channel's buffered bytes are not valid CBOR; the buffer was discarded.
    #[error("malformed message on protocol {protocol} ({mode:?}): {source}")]
    Malformed {
        protocol: ProtocolId,
        mode: Mode,
        #[source]
        source: CodecError,
    },
}

/// Errors surfaced by session and server lifecycles.
#[derive(Debug, Error)]
pub enum SessionError {
    /// `start` was called while the session is running.
    #[error("session already started")]
    AlreadyStarted,

    /// Every connection attempt failed.
    #[error("failed to connect after {attempts} attempts: {last_error}")]
    ConnectFailed { attempts: u32, last_error: String },

    /// A single connection attempt exceeded the timeout.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The peer refused the handshake. Never retried.
    #[error("handshake refused: {0}")]
    Handshake(RefuseReason),

    /// The handshake did not finish in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The proposal was a version query; the peer listed its versions.
    #[error("peer answered a version query with {versions:?}")]
    Queried { versions: Vec<u64> },

    /// The connection closed before the handshake finished.
    #[error("connection closed during handshake")]
    ClosedDuringHandshake,

    /// The session was shut down while starting.
    #[error("session shut down")]
    Shutdown,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
