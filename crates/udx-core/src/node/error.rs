//! Error types for the async driver.
//!
//! Engine errors keep their [`crate::Error`] value so callers can still
//! match on, say, `AlreadyConnected`. Driver-level failures are grouped so
//! callers can tell a retry from a dead end.

use std::borrow::Cow;
use thiserror::Error;
use udx_transport::TransportError;

/// Errors from [`Node`](super::Node) operations
#[derive(Debug, Error)]
pub enum NodeError {
    /// The engine rejected the call
    #[error("engine error: {0}")]
    Engine(#[from] crate::Error),

    /// Binding or polling a socket failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The node is not in a state that allows the operation
    #[error("invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// A background task ended unexpectedly
    #[error("task join error: {0}")]
    TaskJoin(Cow<'static, str>),
}

impl NodeError {
    /// Returns true if the operation may succeed when retried later
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            NodeError::Transport(TransportError::Io(e)) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        NodeError::InvalidState(Cow::Borrowed(context))
    }
}

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;
