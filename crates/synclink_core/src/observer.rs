//! Notifications for the sync protocol layer.

use std::collections::BTreeSet;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::connection::ConnectionState;
use crate::endpoint::{ConnectionId, Endpoint, SessionId};

/// A lifecycle transition of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// Connection that changed state.
    pub connection: ConnectionId,
    /// Its endpoint.
    pub endpoint: Endpoint,
    /// Previous state.
    pub from: ConnectionState,
    /// New state.
    pub to: ConnectionState,
    /// Whether uploading is allowed in the new state.
    pub upload_enabled: bool,
    /// Sessions bound to the connection after the transition.
    pub sessions: BTreeSet<SessionId>,
}

/// Receives lifecycle notifications so the protocol layer can gate its
/// upload and download cursors.
///
/// Called with the endpoint's lifecycle lock held, in transition order.
/// Implementations must not call back into the manager from inside a
/// notification; unlike [`ErrorHandler`](crate::ErrorHandler) callbacks,
/// these run before the lock is released.
pub trait ProtocolObserver: Send + Sync {
    /// A connection changed state.
    fn on_state_change(&self, change: &StateChange);

    /// A protocol payload arrived on a connection.
    fn on_data(&self, _connection: ConnectionId, _payload: &Bytes) {}
}

/// Observer that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProtocolObserver for NoopObserver {
    fn on_state_change(&self, _change: &StateChange) {}
}

/// Observer that keeps every notification, for tests and simulations.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    changes: Mutex<Vec<StateChange>>,
    data: Mutex<Vec<(ConnectionId, Bytes)>>,
}

impl RecordingObserver {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every recorded transition.
    pub fn changes(&self) -> Vec<StateChange> {
        self.changes.lock().clone()
    }

    /// Returns the `(from, to)` pairs of every recorded transition.
    pub fn transitions(&self) -> Vec<(ConnectionState, ConnectionState)> {
        self.changes.lock().iter().map(|c| (c.from, c.to)).collect()
    }

    /// Returns every recorded payload.
    pub fn data(&self) -> Vec<(ConnectionId, Bytes)> {
        self.data.lock().clone()
    }
}

impl ProtocolObserver for RecordingObserver {
    fn on_state_change(&self, change: &StateChange) {
        self.changes.lock().push(change.clone());
    }

    fn on_data(&self, connection: ConnectionId, payload: &Bytes) {
        self.data.lock().push((connection, payload.clone()));
    }
}
