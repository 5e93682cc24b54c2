//! Error types for the node facade.

use ouronet_chainstate::ChainStateError;
use ouronet_protocol::{AgentError, SessionError};
use thiserror::Error;

/// Errors that can occur while building or running a node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Session lifecycle error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Agent binding or listener error.
    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    /// Chain-state backend error.
    #[error("chain state error: {0}")]
    ChainState(#[from] ChainStateError),

    /// Socket error while binding a listener.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested combination of options is not valid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
