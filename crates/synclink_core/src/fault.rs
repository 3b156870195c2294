//! Fault classification.

use std::fmt;

use crate::endpoint::{ConnectionId, Endpoint, SessionId};
use crate::error::SyncError;
use crate::logging::LogLevel;

/// Kind of fault reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// The handshake did not finish within the connect timeout. A retry is
    /// scheduled.
    ConnectTimeout,
    /// A ping went unanswered. Counts as a disconnect for fast-reconnect
    /// accounting; a reconnect is scheduled.
    HeartbeatTimeout,
    /// The channel was lost or could not be opened. A reconnect is
    /// scheduled.
    TransportError,
    /// Authentication rejection or fatal server error. Terminal for the
    /// affected sessions; never retried.
    ProtocolFatal,
    /// Bad configuration such as an unreadable pinned certificate. Fails
    /// the attempt; retried in case the configuration is corrected.
    ConfigurationError,
}

impl FaultKind {
    /// Returns true if the affected sessions cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FaultKind::ProtocolFatal)
    }

    /// Default severity used when logging this kind.
    pub fn severity(&self) -> LogLevel {
        match self {
            FaultKind::ProtocolFatal => LogLevel::Fatal,
            FaultKind::ConfigurationError => LogLevel::Error,
            FaultKind::ConnectTimeout | FaultKind::HeartbeatTimeout | FaultKind::TransportError => {
                LogLevel::Warn
            }
        }
    }

    /// Classifies an error raised while driving a connection.
    pub fn from_error(error: &SyncError) -> Self {
        match error {
            SyncError::ConnectTimeout { .. } => FaultKind::ConnectTimeout,
            SyncError::HeartbeatTimeout { .. } => FaultKind::HeartbeatTimeout,
            SyncError::ProtocolFatal(_) => FaultKind::ProtocolFatal,
            SyncError::Configuration(_) | SyncError::Io(_) => FaultKind::ConfigurationError,
            SyncError::Transport { retryable: false, .. } => FaultKind::ProtocolFatal,
            _ => FaultKind::TransportError,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::ConnectTimeout => "connect_timeout",
            FaultKind::HeartbeatTimeout => "heartbeat_timeout",
            FaultKind::TransportError => "transport_error",
            FaultKind::ProtocolFatal => "protocol_fatal",
            FaultKind::ConfigurationError => "configuration_error",
        };
        f.write_str(name)
    }
}

/// One reported fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultRecord {
    /// Classification.
    pub kind: FaultKind,
    /// Log severity.
    pub severity: LogLevel,
    /// Human-readable description.
    pub message: String,
    /// Session the fault originated from; `None` for connection-wide faults.
    pub session: Option<SessionId>,
    /// Sessions terminated by this fault (fatal faults only).
    pub affected_sessions: Vec<SessionId>,
    /// Connection that produced the fault.
    pub connection: ConnectionId,
    /// Endpoint of that connection.
    pub endpoint: Endpoint,
    /// Generation order within the connection, starting at 1.
    pub sequence: u64,
}

impl FaultRecord {
    /// Returns true if the fault is terminal for its sessions.
    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {} #{}] {}: {}",
            self.endpoint, self.connection, self.sequence, self.kind, self.message
        )?;
        if let Some(session) = &self.session {
            write!(f, " (session {session})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(FaultKind::ProtocolFatal.is_fatal());
        assert!(!FaultKind::HeartbeatTimeout.is_fatal());
        assert_eq!(FaultKind::ProtocolFatal.severity(), LogLevel::Fatal);
        assert_eq!(FaultKind::ConnectTimeout.severity(), LogLevel::Warn);

        assert_eq!(
            FaultKind::from_error(&SyncError::transport_retryable("reset")),
            FaultKind::TransportError
        );
        assert_eq!(
            FaultKind::from_error(&SyncError::transport_fatal("bad certificate")),
            FaultKind::ProtocolFatal
        );
        assert_eq!(
            FaultKind::from_error(&SyncError::Configuration("pin".into())),
            FaultKind::ConfigurationError
        );
    }

    #[test]
    fn record_display() {
        let record = FaultRecord {
            kind: FaultKind::HeartbeatTimeout,
            severity: LogLevel::Warn,
            message: "no pong".into(),
            session: None,
            affected_sessions: Vec::new(),
            connection: ConnectionId(3),
            endpoint: Endpoint::new("sync.example.com", 443, true),
            sequence: 2,
        };
        assert_eq!(
            record.to_string(),
            "[wss://sync.example.com:443 conn#3 #2] heartbeat_timeout: no pong"
        );
    }
}
