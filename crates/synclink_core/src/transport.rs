//! Transport layer abstraction.
//!
//! The transport owns everything below the sync protocol: address
//! resolution, TCP, TLS (including checking the peer against the pinned
//! certificate) and the duplex-channel handshake. The connection lifecycle
//! only opens, writes to and closes channels; everything the transport
//! learns afterwards comes back through
//! `SessionMultiplexer::handle_transport_event`.

use bytes::Bytes;
use parking_lot::Mutex;

use crate::endpoint::{ConnectionHandle, ConnectionId, Endpoint};
use crate::error::{SyncError, SyncResult};
use crate::pinning::PinnedCertificate;
use crate::timing::TimingPolicy;

/// Everything the transport needs to open one channel.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// Handle identifying this open attempt in later calls and events.
    pub handle: ConnectionHandle,
    /// Connection the attempt belongs to.
    pub connection: ConnectionId,
    /// Target endpoint, including headers and authorization header name.
    pub endpoint: Endpoint,
    /// Timing policy captured when the attempt started.
    pub timing: TimingPolicy,
    /// Pinned certificate for the endpoint's host, if configured.
    pub pinned: Option<PinnedCertificate>,
}

/// Frames written by the connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Heartbeat probe.
    Ping {
        /// Sequence number of the probe.
        sequence: u64,
    },
}

/// Frames received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Heartbeat reply.
    Pong {
        /// Sequence number echoed from the ping.
        sequence: u64,
    },
    /// Protocol payload, forwarded to the protocol observer.
    Data(Bytes),
}

/// Notifications from the transport about one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Resolution, connect, TLS and the sync handshake all succeeded.
    HandshakeCompleted,
    /// The server refused the client (authentication rejection, protocol
    /// version mismatch, fatal server error).
    Rejected {
        /// Server-provided reason.
        reason: String,
    },
    /// A frame arrived.
    Frame(InboundFrame),
    /// The channel was lost.
    Disconnected {
        /// Transport-provided reason.
        reason: String,
    },
}

/// A sync transport handles network communication with the sync server.
///
/// Calls are made while the endpoint's lifecycle lock is held, so
/// implementations must not report events synchronously from inside these
/// methods; deliver them from the transport's own I/O task instead.
pub trait ConnectionTransport: Send + Sync {
    /// Starts opening a channel. Completion is reported later as
    /// [`TransportEvent::HandshakeCompleted`].
    fn open(&self, request: &OpenRequest) -> SyncResult<()>;

    /// Writes a frame to an open channel.
    fn send(&self, handle: ConnectionHandle, frame: OutboundFrame) -> SyncResult<()>;

    /// Closes a channel. The channel is closed when this returns.
    fn close(&self, handle: ConnectionHandle) -> SyncResult<()>;
}

/// One call recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    /// `open` was called.
    Open {
        /// Handle of the attempt.
        handle: ConnectionHandle,
        /// Endpoint being opened.
        endpoint: Endpoint,
    },
    /// `send` was called.
    Send {
        /// Target channel.
        handle: ConnectionHandle,
        /// Frame written.
        frame: OutboundFrame,
    },
    /// `close` was called.
    Close {
        /// Channel closed.
        handle: ConnectionHandle,
    },
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<TransportCall>,
    requests: Vec<OpenRequest>,
    fail_next_open: Option<SyncError>,
    fail_sends: bool,
}

/// A mock transport for testing.
///
/// Records every call and never completes a handshake on its own; tests
/// feed events back through the multiplexer.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `open` call fail with `error`.
    pub fn fail_next_open(&self, error: SyncError) {
        self.state.lock().fail_next_open = Some(error);
    }

    /// Makes every `send` call fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    /// Returns every recorded call in order.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().calls.clone()
    }

    /// Returns every open request in order.
    pub fn open_requests(&self) -> Vec<OpenRequest> {
        self.state.lock().requests.clone()
    }

    /// Returns the handle of the most recent open attempt.
    pub fn last_handle(&self) -> Option<ConnectionHandle> {
        self.state.lock().requests.last().map(|r| r.handle)
    }

    /// Number of `open` calls so far.
    pub fn open_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Number of pings written so far.
    pub fn ping_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    TransportCall::Send {
                        frame: OutboundFrame::Ping { .. },
                        ..
                    }
                )
            })
            .count()
    }

    /// Returns the handles closed so far.
    pub fn closed_handles(&self) -> Vec<ConnectionHandle> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::Close { handle } => Some(*handle),
                _ => None,
            })
            .collect()
    }
}

impl ConnectionTransport for MockTransport {
    fn open(&self, request: &OpenRequest) -> SyncResult<()> {
        let mut state = self.state.lock();
        if let Some(error) = state.fail_next_open.take() {
            return Err(error);
        }
        state.calls.push(TransportCall::Open {
            handle: request.handle,
            endpoint: request.endpoint.clone(),
        });
        state.requests.push(request.clone());
        Ok(())
    }

    fn send(&self, handle: ConnectionHandle, frame: OutboundFrame) -> SyncResult<()> {
        let mut state = self.state.lock();
        if state.fail_sends {
            return Err(SyncError::transport_retryable("mock send failure"));
        }
        state.calls.push(TransportCall::Send { handle, frame });
        Ok(())
    }

    fn close(&self, handle: ConnectionHandle) -> SyncResult<()> {
        self.state
            .lock()
            .calls
            .push(TransportCall::Close { handle });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(handle: u64) -> OpenRequest {
        OpenRequest {
            handle: ConnectionHandle(handle),
            connection: ConnectionId(1),
            endpoint: Endpoint::new("localhost", 9080, false),
            timing: TimingPolicy::default(),
            pinned: None,
        }
    }

    #[test]
    fn mock_transport_records_calls() {
        let transport = MockTransport::new();
        transport.open(&request(1)).unwrap();
        transport
            .send(ConnectionHandle(1), OutboundFrame::Ping { sequence: 1 })
            .unwrap();
        transport.close(ConnectionHandle(1)).unwrap();

        assert_eq!(transport.open_count(), 1);
        assert_eq!(transport.ping_count(), 1);
        assert_eq!(transport.closed_handles(), vec![ConnectionHandle(1)]);
        assert_eq!(transport.last_handle(), Some(ConnectionHandle(1)));
    }

    #[test]
    fn mock_transport_open_failure() {
        let transport = MockTransport::new();
        transport.fail_next_open(SyncError::transport_retryable("refused"));

        assert!(transport.open(&request(1)).is_err());
        assert!(transport.open(&request(2)).is_ok());
        assert_eq!(transport.open_count(), 1);
    }

    #[test]
    fn mock_transport_send_failure() {
        let transport = MockTransport::new();
        transport.set_fail_sends(true);
        let result = transport.send(ConnectionHandle(1), OutboundFrame::Ping { sequence: 1 });
        assert!(matches!(result, Err(SyncError::Transport { retryable: true, .. })));
    }
}
