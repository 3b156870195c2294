//! Session multiplexing.
//!
//! Every endpoint owns at most one live [`Connection`]; all sessions bound
//! to that endpoint share it. Each endpoint slot has its own lock, so work
//! on one endpoint never waits on another. All inputs for an endpoint
//! (interest changes, transport events, timer polls) are applied under that
//! lock, which serializes them into a single order.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::backoff::{ExponentialBackoff, ReconnectBackoff};
use crate::clock::{Clock, SystemClock};
use crate::connection::{CloseReason, Connection, ConnectionInfo, ConnectionState, LifecycleContext};
use crate::endpoint::{ConnectionHandle, ConnectionId, Endpoint, SessionId};
use crate::error::{SyncError, SyncResult};
use crate::fault::{FaultKind, FaultRecord};
use crate::logging::SyncLogger;
use crate::observer::{NoopObserver, ProtocolObserver};
use crate::pinning::{CertificateValidator, DerValidator};
use crate::reporter::ErrorReporter;
use crate::stats::{ManagerStats, StatsRecorder};
use crate::timing::TimingPolicy;
use crate::transport::{ConnectionTransport, TransportEvent};

/// Maps transport handles back to their endpoints.
#[derive(Debug)]
pub(crate) struct HandleRegistry {
    next: AtomicU64,
    live: RwLock<HashMap<ConnectionHandle, Endpoint>>,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
            live: RwLock::new(HashMap::new()),
        }
    }
}

impl HandleRegistry {
    pub fn allocate(&self, endpoint: &Endpoint) -> ConnectionHandle {
        let handle = ConnectionHandle(self.next.fetch_add(1, Ordering::Relaxed));
        self.live.write().insert(handle, endpoint.clone());
        handle
    }

    pub fn release(&self, handle: ConnectionHandle) {
        self.live.write().remove(&handle);
    }

    pub fn lookup(&self, handle: ConnectionHandle) -> Option<Endpoint> {
        self.live.read().get(&handle).cloned()
    }
}

#[derive(Debug)]
struct EndpointSlot {
    endpoint: Endpoint,
    connection: Option<Connection>,
    /// Survives connection instances for fast reconnect detection.
    last_disconnect: Option<Instant>,
}

#[derive(Debug, Clone)]
struct SessionBinding {
    endpoint: Endpoint,
    terminated: bool,
}

/// Shares one connection per endpoint among any number of sessions.
pub struct SessionMultiplexer<T: ConnectionTransport> {
    transport: Arc<T>,
    clock: Arc<dyn Clock>,
    reporter: ErrorReporter,
    logger: SyncLogger,
    observer: Arc<dyn ProtocolObserver>,
    validator: Arc<dyn CertificateValidator>,
    backoff: Arc<dyn ReconnectBackoff>,
    timing: Arc<RwLock<TimingPolicy>>,
    slots: RwLock<HashMap<Endpoint, Arc<Mutex<EndpointSlot>>>>,
    sessions: Mutex<HashMap<SessionId, SessionBinding>>,
    handles: HandleRegistry,
    next_connection: AtomicU64,
    stats: StatsRecorder,
    wake: Arc<Notify>,
}

impl<T: ConnectionTransport> SessionMultiplexer<T> {
    /// Creates a multiplexer with default collaborators.
    pub fn new(transport: T) -> Self {
        Self::with_shared_transport(Arc::new(transport))
    }

    /// Creates a multiplexer over a transport shared with other code.
    pub fn with_shared_transport(transport: Arc<T>) -> Self {
        Self {
            transport,
            clock: Arc::new(SystemClock),
            reporter: ErrorReporter::default(),
            logger: SyncLogger::default(),
            observer: Arc::new(NoopObserver),
            validator: Arc::new(DerValidator),
            backoff: Arc::new(ExponentialBackoff::default()),
            timing: Arc::new(RwLock::new(TimingPolicy::default())),
            slots: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            handles: HandleRegistry::default(),
            next_connection: AtomicU64::new(1),
            stats: StatsRecorder::default(),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Sets the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the error reporter.
    pub fn with_reporter(mut self, reporter: ErrorReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Sets the lifecycle logger.
    pub fn with_logger(mut self, logger: SyncLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Sets the protocol observer.
    pub fn with_observer(mut self, observer: Arc<dyn ProtocolObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Sets the certificate validator used to load pinned certificates.
    pub fn with_validator(mut self, validator: Arc<dyn CertificateValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Sets the reconnect backoff policy.
    pub fn with_backoff(mut self, backoff: Arc<dyn ReconnectBackoff>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the timing policy.
    pub fn with_timing(self, timing: TimingPolicy) -> Self {
        *self.timing.write() = timing;
        self
    }

    /// Shares a timing policy cell with the caller, who may update it at
    /// any time. Updates apply to connection attempts started afterwards.
    pub fn with_shared_timing(mut self, timing: Arc<RwLock<TimingPolicy>>) -> Self {
        self.timing = timing;
        self
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns the current timing policy.
    pub fn timing(&self) -> TimingPolicy {
        *self.timing.read()
    }

    /// Replaces the timing policy for future connection attempts.
    pub fn set_timing(&self, timing: TimingPolicy) {
        *self.timing.write() = timing;
        self.wake.notify_one();
    }

    /// Notified whenever an input may have moved the next deadline.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Declares that `session` wants a connection to `endpoint`.
    ///
    /// Reuses the endpoint's live connection (cancelling a pending linger)
    /// or creates one. Registering the same session for the same endpoint
    /// twice is a no-op.
    pub fn register_interest(&self, session: SessionId, endpoint: &Endpoint) -> SyncResult<()> {
        {
            let mut sessions = self.sessions.lock();
            match sessions.get(&session) {
                Some(binding) if binding.terminated => {
                    return Err(SyncError::SessionTerminated(session));
                }
                Some(binding) if &binding.endpoint == endpoint => return Ok(()),
                Some(binding) => {
                    return Err(SyncError::SessionBoundElsewhere {
                        session,
                        endpoint: binding.endpoint.to_string(),
                    });
                }
                None => {}
            }
            sessions.insert(
                session,
                SessionBinding {
                    endpoint: endpoint.clone(),
                    terminated: false,
                },
            );
        }

        let slot = self.slot(endpoint);
        self.with_slot(&slot, |slot, ctx, now| {
            let reusable = slot.connection.as_ref().is_some_and(|c| c.state().is_live());
            if !reusable {
                let connection = self.new_connection(slot, ctx, now);
                slot.connection = Some(connection);
            }
            if let Some(connection) = slot.connection.as_mut() {
                connection.add_session(session, now, ctx);
            }
        });
        self.wake.notify_one();
        Ok(())
    }

    /// Withdraws `session`'s interest. The connection lingers once its last
    /// session leaves.
    pub fn deregister_interest(&self, session: SessionId) -> SyncResult<()> {
        let binding = self
            .sessions
            .lock()
            .remove(&session)
            .ok_or(SyncError::UnknownSession(session))?;
        if binding.terminated {
            return Ok(());
        }

        if let Some(slot) = self.existing_slot(&binding.endpoint) {
            self.with_slot(&slot, |slot, ctx, now| {
                if let Some(connection) = slot.connection.as_mut() {
                    connection.remove_session(session, now, ctx);
                }
            });
            self.wake.notify_one();
        }
        Ok(())
    }

    /// Reports that `session` has downloaded everything the server had,
    /// which enables uploads on its connection.
    ///
    /// Fails if the session's connection has no handshaken channel.
    pub fn download_complete(&self, session: SessionId) -> SyncResult<()> {
        let slot = self.live_binding(session)?;
        self.with_slot(&slot, |slot, ctx, _now| match slot.connection.as_mut() {
            Some(connection) if connection.state().is_connected() => {
                connection.on_download_complete(session, ctx);
                Ok(())
            }
            Some(connection) => Err(SyncError::InvalidStateTransition {
                from: connection.state().to_string(),
                to: ConnectionState::Active.to_string(),
            }),
            None => Err(SyncError::UnknownSession(session)),
        })
    }

    /// Applies a transport event.
    ///
    /// Events for handles that are no longer current are ignored; events
    /// for handles that were never issued or already released are errors.
    pub fn handle_transport_event(
        &self,
        handle: ConnectionHandle,
        event: TransportEvent,
    ) -> SyncResult<()> {
        let endpoint = self
            .handles
            .lookup(handle)
            .ok_or(SyncError::UnknownHandle(handle))?;
        let slot = self
            .existing_slot(&endpoint)
            .ok_or(SyncError::UnknownHandle(handle))?;

        self.with_slot(&slot, |slot, ctx, now| match slot.connection.as_mut() {
            Some(connection) if connection.handle() == Some(handle) => {
                connection.on_transport_event(event, now, ctx);
            }
            _ => ctx
                .logger
                .debug(|| format!("{endpoint}: stale event for {handle} ignored")),
        });
        self.wake.notify_one();
        Ok(())
    }

    /// Reports a fault the protocol layer detected for one session.
    ///
    /// A fatal fault terminates that session only; the connection keeps
    /// serving the others.
    pub fn report_protocol_fault(
        &self,
        session: SessionId,
        kind: FaultKind,
        message: impl Into<String>,
    ) -> SyncResult<()> {
        let slot = self.live_binding(session)?;
        let message = message.into();
        let found = self.with_slot(&slot, |slot, ctx, now| match slot.connection.as_mut() {
            Some(connection) if connection.sessions().contains(&session) => {
                connection.session_fault(session, kind, message, now, ctx);
                true
            }
            _ => false,
        });
        self.wake.notify_one();
        if found {
            Ok(())
        } else {
            Err(SyncError::UnknownSession(session))
        }
    }

    /// Fires every timer that is due.
    pub fn poll_timers(&self) {
        for slot in self.all_slots() {
            self.with_slot(&slot, |_, _, _| {});
        }
    }

    /// Earliest deadline across all connections.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.all_slots()
            .iter()
            .filter_map(|slot| slot.lock().connection.as_ref().and_then(Connection::next_deadline))
            .min()
    }

    /// Closes every connection and forgets every session.
    pub fn shutdown(&self) {
        for slot in self.all_slots() {
            self.with_slot(&slot, |slot, ctx, now| {
                if let Some(connection) = slot.connection.as_mut() {
                    connection.shutdown(now, ctx);
                }
            });
        }
        self.sessions.lock().clear();
        self.logger.info(|| "connection manager shut down".to_string());
        self.wake.notify_one();
    }

    /// State of the endpoint's current connection.
    pub fn connection_state(&self, endpoint: &Endpoint) -> Option<ConnectionState> {
        self.connection_info(endpoint).map(|info| info.state)
    }

    /// Snapshot of the endpoint's current connection.
    pub fn connection_info(&self, endpoint: &Endpoint) -> Option<ConnectionInfo> {
        let slot = self.existing_slot(endpoint)?;
        let guard = slot.lock();
        guard.connection.as_ref().map(Connection::info)
    }

    /// Connection currently serving `session`.
    pub fn session_connection(&self, session: SessionId) -> Option<ConnectionId> {
        let endpoint = self.sessions.lock().get(&session)?.endpoint.clone();
        let slot = self.existing_slot(&endpoint)?;
        let guard = slot.lock();
        guard
            .connection
            .as_ref()
            .filter(|c| c.sessions().contains(&session))
            .map(Connection::id)
    }

    /// Returns true if `session` was terminated by a fatal fault.
    pub fn is_terminated(&self, session: SessionId) -> bool {
        self.sessions
            .lock()
            .get(&session)
            .is_some_and(|binding| binding.terminated)
    }

    /// Number of connections that are not closing or closed.
    pub fn live_connection_count(&self) -> usize {
        self.all_slots()
            .iter()
            .filter(|slot| {
                slot.lock()
                    .connection
                    .as_ref()
                    .is_some_and(|c| c.state().is_live())
            })
            .count()
    }

    /// Activity counters.
    pub fn stats(&self) -> ManagerStats {
        self.stats.snapshot()
    }

    fn context(&self) -> LifecycleContext<'_> {
        LifecycleContext {
            transport: self.transport.as_ref(),
            logger: &self.logger,
            observer: self.observer.as_ref(),
            validator: self.validator.as_ref(),
            backoff: self.backoff.as_ref(),
            handles: &self.handles,
            stats: &self.stats,
            timing: *self.timing.read(),
        }
    }

    fn slot(&self, endpoint: &Endpoint) -> Arc<Mutex<EndpointSlot>> {
        if let Some(slot) = self.existing_slot(endpoint) {
            return slot;
        }
        let mut slots = self.slots.write();
        let slot = slots.entry(endpoint.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(EndpointSlot {
                endpoint: endpoint.clone(),
                connection: None,
                last_disconnect: None,
            }))
        });
        Arc::clone(slot)
    }

    fn existing_slot(&self, endpoint: &Endpoint) -> Option<Arc<Mutex<EndpointSlot>>> {
        self.slots.read().get(endpoint).cloned()
    }

    fn all_slots(&self) -> Vec<Arc<Mutex<EndpointSlot>>> {
        self.slots.read().values().cloned().collect()
    }

    fn live_binding(&self, session: SessionId) -> SyncResult<Arc<Mutex<EndpointSlot>>> {
        let endpoint = match self.sessions.lock().get(&session) {
            Some(binding) if binding.terminated => return Err(SyncError::SessionTerminated(session)),
            Some(binding) => binding.endpoint.clone(),
            None => return Err(SyncError::UnknownSession(session)),
        };
        self.existing_slot(&endpoint)
            .ok_or(SyncError::UnknownSession(session))
    }

    fn new_connection(
        &self,
        slot: &EndpointSlot,
        ctx: &LifecycleContext<'_>,
        now: Instant,
    ) -> Connection {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        self.stats.connection_created();
        self.logger
            .detail(|| format!("{}: new connection {}", slot.endpoint, id));
        Connection::new(id, slot.endpoint.clone(), ctx.timing, slot.last_disconnect, now)
    }

    /// Runs `f` under the endpoint lock, then fires due timers and replaces a
    /// recoverably closed connection with a successor. Faults produced along
    /// the way are reported in order once the lock is released, so error
    /// handlers may call back into the multiplexer.
    fn with_slot<R>(
        &self,
        slot: &Mutex<EndpointSlot>,
        f: impl FnOnce(&mut EndpointSlot, &LifecycleContext<'_>, Instant) -> R,
    ) -> R {
        let now = self.clock.now();
        let ctx = self.context();
        let mut guard = slot.lock();
        let result = f(&mut guard, &ctx, now);
        let (terminated, faults) = self.settle(&mut guard, &ctx, now);
        drop(guard);

        if !terminated.is_empty() {
            self.stats.sessions_terminated(terminated.len());
            let mut sessions = self.sessions.lock();
            for session in terminated {
                if let Some(binding) = sessions.get_mut(&session) {
                    binding.terminated = true;
                }
            }
        }

        for fault in &faults {
            self.stats.fault_reported();
            self.reporter.report(fault);
        }
        result
    }

    /// Returns the sessions terminated and the faults raised, in order.
    fn settle(
        &self,
        slot: &mut EndpointSlot,
        ctx: &LifecycleContext<'_>,
        now: Instant,
    ) -> (Vec<SessionId>, Vec<FaultRecord>) {
        let mut faults: Vec<FaultRecord> = Vec::new();
        let mut terminated = Vec::new();

        while let Some(connection) = slot.connection.as_mut() {
            connection.poll(now, ctx);
            faults.extend(connection.drain_faults());
            terminated.extend(connection.take_terminated());
            if connection.state() != ConnectionState::Closed {
                break;
            }

            let Some(closed) = slot.connection.take() else {
                break;
            };
            if closed.last_disconnect().is_some() {
                slot.last_disconnect = closed.last_disconnect();
            }
            let reason = closed.close_reason();
            let attempt = closed.reconnect_attempt();
            let id = closed.id();
            let sessions: BTreeSet<SessionId> = closed.into_sessions();

            match reason {
                Some(CloseReason::Recoverable(kind)) if !sessions.is_empty() => {
                    let delay = ctx.backoff.delay_for_attempt(attempt);
                    let mut successor = self.new_connection(slot, ctx, now);
                    self.logger.detail(|| {
                        format!(
                            "{}: {} closed ({}), {} reconnects in {} ms",
                            slot.endpoint,
                            id,
                            kind,
                            successor.id(),
                            delay.as_millis()
                        )
                    });
                    successor.resume(sessions, attempt, now + delay);
                    slot.connection = Some(successor);
                }
                _ => {
                    self.logger
                        .detail(|| format!("{}: {} closed", slot.endpoint, id));
                    break;
                }
            }
        }

        (terminated, faults)
    }
}

impl<T: ConnectionTransport> std::fmt::Debug for SessionMultiplexer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMultiplexer")
            .field("endpoints", &self.slots.read().len())
            .field("sessions", &self.sessions.lock().len())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
