//! Connection lifecycle state machine.
//!
//! A [`Connection`] is one logical connection to one endpoint:
//!
//! ```text
//! Idle -> Connecting -> SuspendedUpload -> Active
//!   ^         |               |              |
//!   |   (timeout/fail)        +--> Lingering <+
//!   +---------+                        |
//!                        Closing <-----+--- (fault, linger expiry, shutdown)
//!                           |
//!                        Closed
//! ```
//!
//! The machine is driven by three kinds of input: session interest changes,
//! transport events and the clock. Timers are plain deadlines checked in
//! [`Connection::poll`]; the multiplexer calls it after every input and
//! whenever [`Connection::next_deadline`] passes. Faults produced while
//! handling an input are queued and reported by the multiplexer once any
//! local recovery (retry or successor connection) has been scheduled.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Instant;

use serde::Serialize;

use crate::backoff::ReconnectBackoff;
use crate::endpoint::{ConnectionHandle, ConnectionId, Endpoint, SessionId};
use crate::error::SyncError;
use crate::fault::{FaultKind, FaultRecord};
use crate::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use crate::logging::SyncLogger;
use crate::multiplexer::HandleRegistry;
use crate::observer::{ProtocolObserver, StateChange};
use crate::pinning::CertificateValidator;
use crate::stats::StatsRecorder;
use crate::timing::TimingPolicy;
use crate::transport::{ConnectionTransport, InboundFrame, OpenRequest, OutboundFrame, TransportEvent};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected; waiting for interest or a reconnect deadline.
    Idle,
    /// Channel being opened, handshake in progress.
    Connecting,
    /// Connected; uploads held until the download catches up.
    SuspendedUpload,
    /// Connected; uploads and downloads flowing.
    Active,
    /// Connected with no interested sessions, waiting out the linger time.
    Lingering,
    /// Tearing down the channel.
    Closing,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Returns true for states that count as the endpoint's live
    /// connection.
    pub fn is_live(&self) -> bool {
        !matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }

    /// Returns true while a handshaken channel exists. The heartbeat runs
    /// exactly in these states.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::SuspendedUpload | ConnectionState::Active | ConnectionState::Lingering
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::SuspendedUpload => "suspended_upload",
            ConnectionState::Active => "active",
            ConnectionState::Lingering => "lingering",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a connection reached [`ConnectionState::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The linger time expired with no interest.
    LingerExpired,
    /// A recoverable fault; interested sessions move to a successor.
    Recoverable(FaultKind),
    /// A fatal fault; every bound session is terminated.
    Fatal,
    /// The manager shut down.
    Shutdown,
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection id.
    pub id: ConnectionId,
    /// Endpoint.
    pub endpoint: Endpoint,
    /// Current state.
    pub state: ConnectionState,
    /// Whether uploads are allowed.
    pub upload_enabled: bool,
    /// Bound sessions.
    pub sessions: BTreeSet<SessionId>,
    /// Current transport handle, if a channel is open or opening.
    pub handle: Option<ConnectionHandle>,
    /// Pending reconnect deadline.
    pub reconnect_at: Option<Instant>,
    /// Consecutive failed attempts since the last handshake.
    pub reconnect_attempt: u32,
    /// When the last handshaken channel to this endpoint was lost.
    pub last_disconnect: Option<Instant>,
    /// Last time anything arrived from the server.
    pub last_activity: Instant,
}

/// Collaborators a connection needs while handling one input.
pub(crate) struct LifecycleContext<'a> {
    pub transport: &'a dyn ConnectionTransport,
    pub logger: &'a SyncLogger,
    pub observer: &'a dyn ProtocolObserver,
    pub validator: &'a dyn CertificateValidator,
    pub backoff: &'a dyn ReconnectBackoff,
    pub handles: &'a HandleRegistry,
    pub stats: &'a StatsRecorder,
    /// Timing policy in effect for this input.
    pub timing: TimingPolicy,
}

/// One logical connection to an endpoint.
#[derive(Debug)]
pub(crate) struct Connection {
    id: ConnectionId,
    endpoint: Endpoint,
    timing: TimingPolicy,
    state: ConnectionState,
    handle: Option<ConnectionHandle>,
    sessions: BTreeSet<SessionId>,
    /// Connected state the connection left when it started lingering.
    ///
    /// Interest returning during linger resumes this state rather than
    /// `Active`, so a connection that lingered out of `SuspendedUpload`
    /// keeps uploads gated until its download completes.
    resume_state: ConnectionState,
    connect_deadline: Option<Instant>,
    linger_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    reconnect_attempt: u32,
    last_activity: Instant,
    last_disconnect: Option<Instant>,
    heartbeat: HeartbeatMonitor,
    ping_sequence: u64,
    fault_sequence: u64,
    pending_faults: Vec<FaultRecord>,
    terminated: Vec<SessionId>,
    close_reason: Option<CloseReason>,
}

impl Connection {
    /// Creates an idle connection.
    ///
    /// `last_disconnect` carries the endpoint's history forward so fast
    /// reconnect detection spans connection instances.
    pub(crate) fn new(
        id: ConnectionId,
        endpoint: Endpoint,
        timing: TimingPolicy,
        last_disconnect: Option<Instant>,
        now: Instant,
    ) -> Self {
        Self {
            id,
            endpoint,
            timing,
            state: ConnectionState::Idle,
            handle: None,
            sessions: BTreeSet::new(),
            resume_state: ConnectionState::SuspendedUpload,
            connect_deadline: None,
            linger_deadline: None,
            reconnect_at: None,
            reconnect_attempt: 0,
            last_activity: now,
            last_disconnect,
            heartbeat: HeartbeatMonitor::new(timing.ping_keepalive_period, timing.pong_keepalive_timeout),
            ping_sequence: 0,
            fault_sequence: 0,
            pending_faults: Vec::new(),
            terminated: Vec::new(),
            close_reason: None,
        }
    }

    /// Adopts the sessions of a connection that closed recoverably and
    /// schedules the reconnect.
    pub(crate) fn resume(
        &mut self,
        sessions: BTreeSet<SessionId>,
        reconnect_attempt: u32,
        reconnect_at: Instant,
    ) {
        self.sessions = sessions;
        self.reconnect_attempt = reconnect_attempt;
        self.reconnect_at = Some(reconnect_at);
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Bound sessions.
    pub fn sessions(&self) -> &BTreeSet<SessionId> {
        &self.sessions
    }

    /// Current transport handle.
    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.handle
    }

    /// When the last handshaken channel was lost.
    pub fn last_disconnect(&self) -> Option<Instant> {
        self.last_disconnect
    }

    /// Consecutive failed attempts since the last handshake.
    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// Whether uploads are allowed.
    pub fn upload_enabled(&self) -> bool {
        match self.state {
            ConnectionState::Active => true,
            ConnectionState::Lingering => self.resume_state == ConnectionState::Active,
            _ => false,
        }
    }

    /// Snapshot for queries.
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            endpoint: self.endpoint.clone(),
            state: self.state,
            upload_enabled: self.upload_enabled(),
            sessions: self.sessions.clone(),
            handle: self.handle,
            reconnect_at: self.reconnect_at,
            reconnect_attempt: self.reconnect_attempt,
            last_disconnect: self.last_disconnect,
            last_activity: self.last_activity,
        }
    }

    /// Earliest instant at which [`poll`](Self::poll) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadlines = Vec::with_capacity(4);
        if self.state == ConnectionState::Connecting {
            deadlines.extend(self.connect_deadline);
        }
        if self.state.is_connected() {
            deadlines.extend(self.heartbeat.next_deadline());
        }
        if matches!(self.state, ConnectionState::Lingering | ConnectionState::Idle) {
            deadlines.extend(self.linger_deadline);
        }
        if self.state == ConnectionState::Idle && !self.sessions.is_empty() {
            deadlines.extend(self.reconnect_at);
        }
        deadlines.into_iter().min()
    }

    pub(crate) fn drain_faults(&mut self) -> Vec<FaultRecord> {
        std::mem::take(&mut self.pending_faults)
    }

    pub(crate) fn take_terminated(&mut self) -> Vec<SessionId> {
        std::mem::take(&mut self.terminated)
    }

    pub(crate) fn into_sessions(self) -> BTreeSet<SessionId> {
        self.sessions
    }

    /// Binds a session. Returns false if it was already bound.
    ///
    /// The first session on an idle connection with no pending retry starts
    /// the handshake; interest arriving while lingering cancels the linger
    /// and resumes the previous connected state.
    pub(crate) fn add_session(
        &mut self,
        session: SessionId,
        now: Instant,
        ctx: &LifecycleContext<'_>,
    ) -> bool {
        let inserted = self.sessions.insert(session);
        match self.state {
            ConnectionState::Lingering => {
                self.linger_deadline = None;
                ctx.logger
                    .detail(|| format!("{} {}: interest resumed, linger cancelled", self.endpoint, self.id));
                self.transition(self.resume_state, ctx);
            }
            ConnectionState::Idle => {
                self.linger_deadline = None;
                if self.reconnect_at.is_none() {
                    self.connect(now, ctx);
                }
            }
            _ => {}
        }
        inserted
    }

    /// Unbinds a session. Returns false if it was not bound.
    pub(crate) fn remove_session(
        &mut self,
        session: SessionId,
        now: Instant,
        ctx: &LifecycleContext<'_>,
    ) -> bool {
        if !self.sessions.remove(&session) {
            return false;
        }
        if self.sessions.is_empty() {
            self.on_interest_lost(now, ctx);
        }
        true
    }

    fn on_interest_lost(&mut self, now: Instant, ctx: &LifecycleContext<'_>) {
        match self.state {
            ConnectionState::SuspendedUpload | ConnectionState::Active => {
                self.resume_state = self.state;
                self.linger_deadline = Some(now + self.timing.connection_linger_time);
                ctx.logger.detail(|| {
                    format!(
                        "{} {}: no interested sessions, lingering for {} ms",
                        self.endpoint,
                        self.id,
                        self.timing.connection_linger_time.as_millis()
                    )
                });
                self.transition(ConnectionState::Lingering, ctx);
            }
            // A pending retry survives the grace period in case interest
            // comes back.
            ConnectionState::Idle => {
                self.linger_deadline = Some(now + self.timing.connection_linger_time);
            }
            // The handshake runs to completion and decides on arrival.
            ConnectionState::Connecting
            | ConnectionState::Lingering
            | ConnectionState::Closing
            | ConnectionState::Closed => {}
        }
    }

    /// Records that `session` has caught up with the server.
    pub(crate) fn on_download_complete(&mut self, session: SessionId, ctx: &LifecycleContext<'_>) {
        if !self.sessions.contains(&session) {
            return;
        }
        match self.state {
            ConnectionState::SuspendedUpload => {
                ctx.logger
                    .detail(|| format!("{} {}: download complete, enabling upload", self.endpoint, self.id));
                self.transition(ConnectionState::Active, ctx);
            }
            ConnectionState::Lingering => {
                self.resume_state = ConnectionState::Active;
            }
            _ => {}
        }
    }

    /// Handles one transport event for this connection's current handle.
    pub(crate) fn on_transport_event(
        &mut self,
        event: TransportEvent,
        now: Instant,
        ctx: &LifecycleContext<'_>,
    ) {
        match event {
            TransportEvent::HandshakeCompleted => self.on_handshake_complete(now, ctx),
            TransportEvent::Rejected { reason } => {
                let message = SyncError::ProtocolFatal(reason).to_string();
                self.fail_fatal(message, None, now, ctx);
            }
            TransportEvent::Frame(frame) => self.on_frame(frame, now, ctx),
            TransportEvent::Disconnected { reason } => self.on_disconnected(reason, now, ctx),
        }
    }

    fn on_handshake_complete(&mut self, now: Instant, ctx: &LifecycleContext<'_>) {
        if self.state != ConnectionState::Connecting {
            ctx.logger.debug(|| {
                format!("{} {}: handshake completion ignored in state {}", self.endpoint, self.id, self.state)
            });
            return;
        }

        self.connect_deadline = None;
        self.reconnect_attempt = 0;
        self.last_activity = now;

        let fast = self
            .last_disconnect
            .is_some_and(|at| now.saturating_duration_since(at) < self.timing.fast_reconnect_limit);
        ctx.stats.handshake_completed(fast);
        let target = if fast {
            ConnectionState::Active
        } else {
            ConnectionState::SuspendedUpload
        };
        ctx.logger.info(|| {
            format!(
                "{} {}: connected{}",
                self.endpoint,
                self.id,
                if fast { " (fast reconnect)" } else { "" }
            )
        });

        self.heartbeat = HeartbeatMonitor::new(
            self.timing.ping_keepalive_period,
            self.timing.pong_keepalive_timeout,
        );
        self.heartbeat.start(now);

        if self.sessions.is_empty() {
            self.resume_state = target;
            self.linger_deadline = Some(now + self.timing.connection_linger_time);
            self.transition(ConnectionState::Lingering, ctx);
        } else {
            self.transition(target, ctx);
        }
    }

    fn on_frame(&mut self, frame: InboundFrame, now: Instant, ctx: &LifecycleContext<'_>) {
        if !self.state.is_connected() {
            ctx.logger
                .debug(|| format!("{} {}: frame ignored in state {}", self.endpoint, self.id, self.state));
            return;
        }
        self.last_activity = now;
        match frame {
            InboundFrame::Pong { sequence } => {
                if self.heartbeat.on_pong(now) {
                    ctx.logger.trace(|| {
                        format!(
                            "{} {}: pong {} after {:?}",
                            self.endpoint,
                            self.id,
                            sequence,
                            self.heartbeat.last_round_trip().unwrap_or_default()
                        )
                    });
                }
            }
            InboundFrame::Data(payload) => ctx.observer.on_data(self.id, &payload),
        }
    }

    fn on_disconnected(&mut self, reason: String, now: Instant, ctx: &LifecycleContext<'_>) {
        ctx.stats.transport_failure();
        let message = SyncError::transport_retryable(reason).to_string();
        match self.state {
            ConnectionState::Connecting => {
                self.abandon_attempt(false, ctx);
                self.schedule_retry(now, ctx);
                self.raise(FaultKind::TransportError, message, None, Vec::new());
            }
            ConnectionState::SuspendedUpload | ConnectionState::Active | ConnectionState::Lingering => {
                self.close(CloseReason::Recoverable(FaultKind::TransportError), false, now, ctx);
                self.raise(FaultKind::TransportError, message, None, Vec::new());
            }
            ConnectionState::Idle | ConnectionState::Closing | ConnectionState::Closed => {}
        }
    }

    /// Terminates every bound session and closes the connection.
    pub(crate) fn fail_fatal(
        &mut self,
        message: String,
        session: Option<SessionId>,
        now: Instant,
        ctx: &LifecycleContext<'_>,
    ) {
        if self.state == ConnectionState::Closed {
            return;
        }
        let affected: Vec<SessionId> = std::mem::take(&mut self.sessions).into_iter().collect();
        self.close(CloseReason::Fatal, true, now, ctx);
        self.terminated.extend(affected.iter().copied());
        self.raise(FaultKind::ProtocolFatal, message, session, affected);
    }

    /// Records a fault raised by the protocol layer for one session.
    ///
    /// A fatal fault terminates only that session; the connection stays up
    /// for the others.
    pub(crate) fn session_fault(
        &mut self,
        session: SessionId,
        kind: FaultKind,
        message: String,
        now: Instant,
        ctx: &LifecycleContext<'_>,
    ) {
        if kind.is_fatal() {
            self.remove_session(session, now, ctx);
            self.terminated.push(session);
            self.raise(kind, message, Some(session), vec![session]);
        } else {
            self.raise(kind, message, Some(session), Vec::new());
        }
    }

    /// Closes the connection for manager shutdown.
    pub(crate) fn shutdown(&mut self, now: Instant, ctx: &LifecycleContext<'_>) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.sessions.clear();
        self.close(CloseReason::Shutdown, true, now, ctx);
    }

    /// Fires every timer due at `now`.
    ///
    /// Order: connect deadline, heartbeat, linger, reconnect.
    pub(crate) fn poll(&mut self, now: Instant, ctx: &LifecycleContext<'_>) {
        if self.state == ConnectionState::Connecting
            && self.connect_deadline.is_some_and(|deadline| now >= deadline)
        {
            self.on_connect_timeout(now, ctx);
        }

        if self.state.is_connected() {
            match self.heartbeat.poll(now) {
                HeartbeatAction::Idle => {}
                HeartbeatAction::SendPing => self.send_ping(now, ctx),
                HeartbeatAction::Dead => self.on_heartbeat_timeout(now, ctx),
            }
        }

        if self.linger_deadline.is_some_and(|deadline| now >= deadline) {
            match self.state {
                ConnectionState::Lingering => {
                    ctx.logger
                        .detail(|| format!("{} {}: linger time expired", self.endpoint, self.id));
                    self.close(CloseReason::LingerExpired, true, now, ctx);
                }
                ConnectionState::Idle if self.sessions.is_empty() => {
                    ctx.logger.detail(|| {
                        format!("{} {}: no interest, pending reconnect cancelled", self.endpoint, self.id)
                    });
                    self.close(CloseReason::LingerExpired, true, now, ctx);
                }
                _ => {}
            }
        }

        if self.state == ConnectionState::Idle
            && !self.sessions.is_empty()
            && self.reconnect_at.is_some_and(|at| now >= at)
        {
            self.connect(now, ctx);
        }
    }

    fn connect(&mut self, now: Instant, ctx: &LifecycleContext<'_>) {
        self.reconnect_at = None;
        self.linger_deadline = None;
        self.timing = ctx.timing;

        let pinned = match self.endpoint.pinned_certificate.clone() {
            Some(path) => match ctx.validator.load_pinned(&path) {
                Ok(pinned) => Some(pinned),
                Err(e) => {
                    self.schedule_retry(now, ctx);
                    self.raise(FaultKind::ConfigurationError, e.to_string(), None, Vec::new());
                    return;
                }
            },
            None => None,
        };

        let handle = ctx.handles.allocate(&self.endpoint);
        let request = OpenRequest {
            handle,
            connection: self.id,
            endpoint: self.endpoint.clone(),
            timing: self.timing,
            pinned,
        };
        self.handle = Some(handle);
        self.connect_deadline = Some(now + self.timing.connect_timeout);
        ctx.logger.detail(|| {
            format!(
                "{} {}: connecting ({}, attempt {})",
                self.endpoint,
                self.id,
                handle,
                self.reconnect_attempt + 1
            )
        });
        self.transition(ConnectionState::Connecting, ctx);
        ctx.stats.connect_attempt();

        if let Err(e) = ctx.transport.open(&request) {
            self.abandon_attempt(false, ctx);
            if e.is_retryable() {
                ctx.stats.transport_failure();
                self.schedule_retry(now, ctx);
                let kind = FaultKind::from_error(&e);
                self.raise(kind, e.to_string(), None, Vec::new());
            } else {
                self.fail_fatal(e.to_string(), None, now, ctx);
            }
        }
    }

    fn on_connect_timeout(&mut self, now: Instant, ctx: &LifecycleContext<'_>) {
        ctx.stats.connect_timeout();
        let message = SyncError::ConnectTimeout {
            endpoint: self.endpoint.to_string(),
            timeout_ms: self.timing.connect_timeout.as_millis() as u64,
        }
        .to_string();
        self.abandon_attempt(true, ctx);
        self.schedule_retry(now, ctx);
        self.raise(FaultKind::ConnectTimeout, message, None, Vec::new());
    }

    fn send_ping(&mut self, now: Instant, ctx: &LifecycleContext<'_>) {
        let Some(handle) = self.handle else {
            return;
        };
        self.ping_sequence += 1;
        let sequence = self.ping_sequence;
        match ctx.transport.send(handle, OutboundFrame::Ping { sequence }) {
            Ok(()) => {
                ctx.stats.ping_sent();
                ctx.logger
                    .trace(|| format!("{} {}: ping {}", self.endpoint, self.id, sequence));
            }
            Err(e) => {
                ctx.stats.transport_failure();
                self.close(CloseReason::Recoverable(FaultKind::TransportError), true, now, ctx);
                self.raise(FaultKind::TransportError, e.to_string(), None, Vec::new());
            }
        }
    }

    fn on_heartbeat_timeout(&mut self, now: Instant, ctx: &LifecycleContext<'_>) {
        ctx.stats.heartbeat_timeout();
        let message = SyncError::HeartbeatTimeout {
            endpoint: self.endpoint.to_string(),
            timeout_ms: self.timing.pong_keepalive_timeout.as_millis() as u64,
        }
        .to_string();
        self.close(CloseReason::Recoverable(FaultKind::HeartbeatTimeout), true, now, ctx);
        self.raise(FaultKind::HeartbeatTimeout, message, None, Vec::new());
    }

    /// Drops the in-flight attempt and returns to idle.
    fn abandon_attempt(&mut self, close_channel: bool, ctx: &LifecycleContext<'_>) {
        self.connect_deadline = None;
        if let Some(handle) = self.handle.take() {
            if close_channel {
                self.close_handle(handle, ctx);
            }
            ctx.handles.release(handle);
        }
        self.transition(ConnectionState::Idle, ctx);
    }

    fn schedule_retry(&mut self, now: Instant, ctx: &LifecycleContext<'_>) {
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        let delay = ctx.backoff.delay_for_attempt(self.reconnect_attempt);
        self.reconnect_at = Some(now + delay);
        ctx.logger.detail(|| {
            format!(
                "{} {}: retry {} in {} ms",
                self.endpoint,
                self.id,
                self.reconnect_attempt,
                delay.as_millis()
            )
        });
        if self.sessions.is_empty() {
            self.linger_deadline = Some(now + self.timing.connection_linger_time);
        }
    }

    fn close(
        &mut self,
        reason: CloseReason,
        close_channel: bool,
        now: Instant,
        ctx: &LifecycleContext<'_>,
    ) {
        let was_connected = self.state.is_connected();
        self.transition(ConnectionState::Closing, ctx);
        self.connect_deadline = None;
        self.linger_deadline = None;
        self.reconnect_at = None;
        if let Some(handle) = self.handle.take() {
            if close_channel {
                self.close_handle(handle, ctx);
            }
            ctx.handles.release(handle);
        }
        if was_connected {
            self.last_disconnect = Some(now);
        }
        self.close_reason = Some(reason);
        self.transition(ConnectionState::Closed, ctx);
    }

    fn close_handle(&self, handle: ConnectionHandle, ctx: &LifecycleContext<'_>) {
        if let Err(e) = ctx.transport.close(handle) {
            ctx.logger
                .warn(|| format!("{} {}: closing {} failed: {}", self.endpoint, self.id, handle, e));
        }
    }

    fn transition(&mut self, to: ConnectionState, ctx: &LifecycleContext<'_>) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        if from.is_connected() && !to.is_connected() {
            self.heartbeat.stop();
        }
        ctx.logger
            .debug(|| format!("{} {}: {} -> {}", self.endpoint, self.id, from, to));
        ctx.observer.on_state_change(&StateChange {
            connection: self.id,
            endpoint: self.endpoint.clone(),
            from,
            to,
            upload_enabled: self.upload_enabled(),
            sessions: self.sessions.clone(),
        });
    }

    fn raise(
        &mut self,
        kind: FaultKind,
        message: String,
        session: Option<SessionId>,
        affected_sessions: Vec<SessionId>,
    ) {
        self.fault_sequence += 1;
        self.pending_faults.push(FaultRecord {
            kind,
            severity: kind.severity(),
            message,
            session,
            affected_sessions,
            connection: self.id,
            endpoint: self.endpoint.clone(),
            sequence: self.fault_sequence,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ExponentialBackoff;
    use crate::observer::RecordingObserver;
    use crate::pinning::DerValidator;
    use crate::transport::MockTransport;
    use std::time::Duration;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    struct Harness {
        transport: MockTransport,
        logger: SyncLogger,
        observer: RecordingObserver,
        validator: DerValidator,
        backoff: ExponentialBackoff,
        handles: HandleRegistry,
        stats: StatsRecorder,
        timing: TimingPolicy,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                transport: MockTransport::new(),
                logger: SyncLogger::default(),
                observer: RecordingObserver::new(),
                validator: DerValidator,
                backoff: ExponentialBackoff::new(ms(100), ms(1000)).with_jitter(false),
                handles: HandleRegistry::default(),
                stats: StatsRecorder::default(),
                timing: TimingPolicy::new()
                    .with_connect_timeout(ms(1000))
                    .with_connection_linger_time(ms(500))
                    .with_ping_keepalive_period(ms(2000))
                    .with_pong_keepalive_timeout(ms(400))
                    .with_fast_reconnect_limit(ms(3000)),
            }
        }

        fn ctx(&self) -> LifecycleContext<'_> {
            LifecycleContext {
                transport: &self.transport,
                logger: &self.logger,
                observer: &self.observer,
                validator: &self.validator,
                backoff: &self.backoff,
                handles: &self.handles,
                stats: &self.stats,
                timing: self.timing,
            }
        }

        fn connection(&self, now: Instant) -> Connection {
            Connection::new(
                ConnectionId(1),
                Endpoint::new("sync.example.com", 443, true),
                self.timing,
                None,
                now,
            )
        }
    }

    fn connected(h: &Harness, t0: Instant, session: SessionId) -> Connection {
        let mut conn = h.connection(t0);
        conn.add_session(session, t0, &h.ctx());
        conn.on_transport_event(TransportEvent::HandshakeCompleted, t0, &h.ctx());
        conn
    }

    #[test]
    fn first_session_starts_handshake() {
        let h = Harness::new();
        let t0 = Instant::now();
        let mut conn = h.connection(t0);

        assert!(conn.add_session(SessionId::from_u128(1), t0, &h.ctx()));

        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(h.transport.open_count(), 1);
        assert_eq!(conn.next_deadline(), Some(t0 + ms(1000)));
        assert_eq!(conn.handle(), h.transport.last_handle());
    }

    #[test]
    fn fresh_handshake_suspends_upload_until_download_completes() {
        let h = Harness::new();
        let t0 = Instant::now();
        let session = SessionId::from_u128(1);
        let mut conn = connected(&h, t0, session);

        assert_eq!(conn.state(), ConnectionState::SuspendedUpload);
        assert!(!conn.upload_enabled());

        conn.on_download_complete(session, &h.ctx());
        assert_eq!(conn.state(), ConnectionState::Active);
        assert!(conn.upload_enabled());
        assert_eq!(
            h.observer.transitions(),
            vec![
                (ConnectionState::Idle, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::SuspendedUpload),
                (ConnectionState::SuspendedUpload, ConnectionState::Active),
            ]
        );
    }

    #[test]
    fn connect_timeout_schedules_backoff_retry() {
        let h = Harness::new();
        let t0 = Instant::now();
        let mut conn = h.connection(t0);
        conn.add_session(SessionId::from_u128(1), t0, &h.ctx());
        let first = conn.handle().unwrap();

        conn.poll(t0 + ms(1000), &h.ctx());

        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(h.transport.closed_handles(), vec![first]);
        assert_eq!(conn.next_deadline(), Some(t0 + ms(1100)));
        let faults = conn.drain_faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].kind, FaultKind::ConnectTimeout);
        assert_eq!(faults[0].sequence, 1);

        conn.poll(t0 + ms(1100), &h.ctx());
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(h.transport.open_count(), 2);
        assert_ne!(conn.handle(), Some(first));
    }

    #[test]
    fn lingering_resumes_previous_state() {
        let h = Harness::new();
        let t0 = Instant::now();
        let session = SessionId::from_u128(1);
        let mut conn = connected(&h, t0, session);
        conn.on_download_complete(session, &h.ctx());

        conn.remove_session(session, t0 + ms(10), &h.ctx());
        assert_eq!(conn.state(), ConnectionState::Lingering);
        assert_eq!(conn.next_deadline(), Some(t0 + ms(510)));

        conn.add_session(SessionId::from_u128(2), t0 + ms(20), &h.ctx());
        assert_eq!(conn.state(), ConnectionState::Active);
        assert_eq!(h.transport.open_count(), 1);
    }

    #[test]
    fn lingering_keeps_uploads_suspended_until_download_completes() {
        let h = Harness::new();
        let t0 = Instant::now();
        let session = SessionId::from_u128(1);
        let mut conn = connected(&h, t0, session);
        assert_eq!(conn.state(), ConnectionState::SuspendedUpload);

        conn.remove_session(session, t0 + ms(10), &h.ctx());
        assert_eq!(conn.state(), ConnectionState::Lingering);
        assert!(!conn.upload_enabled());

        let returning = SessionId::from_u128(2);
        conn.add_session(returning, t0 + ms(20), &h.ctx());
        assert_eq!(conn.state(), ConnectionState::SuspendedUpload);
        assert!(!conn.upload_enabled());

        conn.on_download_complete(returning, &h.ctx());
        assert_eq!(conn.state(), ConnectionState::Active);
        assert!(conn.upload_enabled());
    }

    #[test]
    fn linger_expiry_closes_and_records_disconnect() {
        let h = Harness::new();
        let t0 = Instant::now();
        let session = SessionId::from_u128(1);
        let mut conn = connected(&h, t0, session);

        conn.remove_session(session, t0, &h.ctx());
        conn.poll(t0 + ms(499), &h.ctx());
        assert_eq!(conn.state(), ConnectionState::Lingering);

        conn.poll(t0 + ms(500), &h.ctx());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.close_reason(), Some(CloseReason::LingerExpired));
        assert_eq!(conn.last_disconnect(), Some(t0 + ms(500)));
        assert!(conn.drain_faults().is_empty());
    }

    #[test]
    fn handshake_after_recent_disconnect_is_fast() {
        let h = Harness::new();
        let t0 = Instant::now();
        let mut conn = Connection::new(
            ConnectionId(2),
            Endpoint::new("sync.example.com", 443, true),
            h.timing,
            Some(t0),
            t0,
        );
        conn.add_session(SessionId::from_u128(1), t0, &h.ctx());
        conn.on_transport_event(TransportEvent::HandshakeCompleted, t0 + ms(2999), &h.ctx());

        assert_eq!(conn.state(), ConnectionState::Active);
        assert_eq!(h.stats.snapshot().fast_reconnects, 1);
    }

    #[test]
    fn handshake_at_fast_reconnect_limit_is_not_fast() {
        let h = Harness::new();
        let t0 = Instant::now();
        let mut conn = Connection::new(
            ConnectionId(2),
            Endpoint::new("sync.example.com", 443, true),
            h.timing,
            Some(t0),
            t0,
        );
        conn.add_session(SessionId::from_u128(1), t0, &h.ctx());
        conn.on_transport_event(TransportEvent::HandshakeCompleted, t0 + ms(3000), &h.ctx());

        assert_eq!(conn.state(), ConnectionState::SuspendedUpload);
    }

    #[test]
    fn missed_pong_closes_recoverably() {
        let h = Harness::new();
        let t0 = Instant::now();
        let mut conn = connected(&h, t0, SessionId::from_u128(1));

        conn.poll(t0 + ms(2000), &h.ctx());
        assert_eq!(h.transport.ping_count(), 1);

        conn.poll(t0 + ms(2400), &h.ctx());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(
            conn.close_reason(),
            Some(CloseReason::Recoverable(FaultKind::HeartbeatTimeout))
        );
        assert_eq!(conn.last_disconnect(), Some(t0 + ms(2400)));
        assert_eq!(conn.sessions().len(), 1);
    }

    #[test]
    fn rejection_terminates_every_session() {
        let h = Harness::new();
        let t0 = Instant::now();
        let a = SessionId::from_u128(1);
        let b = SessionId::from_u128(2);
        let mut conn = h.connection(t0);
        conn.add_session(a, t0, &h.ctx());
        conn.add_session(b, t0, &h.ctx());

        conn.on_transport_event(
            TransportEvent::Rejected {
                reason: "bad token".into(),
            },
            t0 + ms(5),
            &h.ctx(),
        );

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.close_reason(), Some(CloseReason::Fatal));
        assert_eq!(conn.take_terminated(), vec![a, b]);
        // Never handshaken, so no disconnect is recorded.
        assert_eq!(conn.last_disconnect(), None);

        let faults = conn.drain_faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].kind, FaultKind::ProtocolFatal);
        assert_eq!(faults[0].session, None);
        assert_eq!(faults[0].affected_sessions, vec![a, b]);
    }
}
