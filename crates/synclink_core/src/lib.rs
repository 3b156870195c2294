//! # Synclink Core
//!
//! Client-side connection management for a real-time sync protocol.
//!
//! This crate provides:
//! - Connection lifecycle state machine (idle → connecting → suspended
//!   upload → active → lingering → closed)
//! - Ping/pong heartbeat with fixed-phase probing
//! - Session multiplexing: one connection per endpoint, shared by every
//!   session bound to it
//! - Fast reconnect detection and reconnect backoff
//! - Certificate pinning (DER, optionally PEM)
//! - Fault classification and reporting to an application handler
//! - Level-gated logging bridged to `tracing` or a custom sink
//! - A tokio timer driver, plus mock transport and manual clock for tests
//!
//! ## Architecture
//!
//! Everything below the sync protocol (DNS, TCP, TLS, the channel
//! handshake) lives behind [`ConnectionTransport`]. The lifecycle never
//! blocks and owns no timers: it keeps deadlines, and the caller (or the
//! [`TimerDriver`]) calls [`SessionMultiplexer::poll_timers`] when the next
//! one passes. Time comes from an injected [`Clock`].
//!
//! ## Key Invariants
//!
//! - At most one live connection per endpoint
//! - Uploads stay disabled until the download has caught up, unless the
//!   handshake is a fast reconnect
//! - Each missed pong is reported exactly once
//! - Faults are reported after local recovery is scheduled, in the order
//!   they were produced per connection
//! - Fatal faults terminate their sessions; nothing retries them

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod clock;
mod config;
mod connection;
mod driver;
mod endpoint;
mod error;
mod fault;
mod heartbeat;
mod logging;
mod manager;
mod multiplexer;
mod observer;
mod pinning;
mod reporter;
mod stats;
mod timing;
mod transport;

pub use backoff::{ExponentialBackoff, ReconnectBackoff};
pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use config::{ClientConfig, USER_AGENT_HEADER};
pub use connection::{ConnectionInfo, ConnectionState};
pub use driver::{spawn_timer_driver, TimerDriver};
pub use endpoint::{ConnectionHandle, ConnectionId, Endpoint, SessionId};
pub use error::{SyncError, SyncResult};
pub use fault::{FaultKind, FaultRecord};
pub use heartbeat::{HeartbeatAction, HeartbeatMonitor};
pub use logging::{ChannelLogSink, LogLevel, LogRecord, LogSink, SyncLogger};
pub use manager::SyncManager;
pub use multiplexer::SessionMultiplexer;
pub use observer::{NoopObserver, ProtocolObserver, RecordingObserver, StateChange};
pub use pinning::{
    fingerprint, CertificateFormat, CertificateValidator, DerValidator, ExtendedValidator,
    Fingerprint, PinnedCertificate,
};
pub use reporter::{ErrorHandler, ErrorReporter, FaultChannel};
pub use stats::ManagerStats;
pub use timing::{TimingPolicy, TimingWarning};
pub use transport::{
    ConnectionTransport, InboundFrame, MockTransport, OpenRequest, OutboundFrame, TransportCall,
    TransportEvent,
};
