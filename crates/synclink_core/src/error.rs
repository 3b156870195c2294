//! Error types for the connection manager.

use thiserror::Error;

use crate::endpoint::{ConnectionHandle, SessionId};

/// Result type for connection manager operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while managing sync connections.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The handshake did not complete within the connect timeout.
    #[error("connection to {endpoint} not established within {timeout_ms} ms")]
    ConnectTimeout {
        /// Endpoint display string.
        endpoint: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// No pong arrived within the pong keepalive timeout.
    #[error("no pong from {endpoint} within {timeout_ms} ms")]
    HeartbeatTimeout {
        /// Endpoint display string.
        endpoint: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The server rejected the client or reported a fatal error.
    #[error("fatal protocol error: {0}")]
    ProtocolFatal(String),

    /// Invalid or unreadable configuration (e.g. a pinned certificate file).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A setting that is frozen at first connection open was changed later.
    #[error("{0} cannot be changed after the first connection has been opened")]
    ConfigurationFrozen(&'static str),

    /// The session is not registered with the multiplexer.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// The session was terminated by a fatal error and cannot be reused.
    #[error("session {0} was terminated by a fatal error")]
    SessionTerminated(SessionId),

    /// The session is already bound to a different endpoint.
    #[error("session {session} is already bound to {endpoint}")]
    SessionBoundElsewhere {
        /// Session identifier.
        session: SessionId,
        /// Endpoint the session is currently bound to.
        endpoint: String,
    },

    /// An event arrived for a connection handle that is no longer live.
    #[error("unknown connection handle {0}")]
    UnknownHandle(ConnectionHandle),

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// I/O error (reading certificate or configuration files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::ConnectTimeout { .. } => true,
            SyncError::HeartbeatTimeout { .. } => true,
            SyncError::Configuration(_) => true,
            SyncError::Io(_) => true,
            _ => false,
        }
    }
}
