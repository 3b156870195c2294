//! Process-wide sync connection manager.
//!
//! [`SyncManager`] owns the client configuration and builds the
//! [`SessionMultiplexer`] the first time a session registers interest. The
//! log level, log sink and error handler are captured at that moment and
//! cannot be changed afterwards; timing, headers and pinned certificates
//! can, and apply to connections opened after the change.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::RwLock;

use crate::backoff::{ExponentialBackoff, ReconnectBackoff};
use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfig;
use crate::connection::{ConnectionInfo, ConnectionState};
use crate::driver::{spawn_timer_driver, TimerDriver};
use crate::endpoint::{ConnectionHandle, Endpoint, SessionId};
use crate::error::{SyncError, SyncResult};
use crate::fault::FaultKind;
use crate::logging::{LogLevel, LogSink, SyncLogger};
use crate::multiplexer::SessionMultiplexer;
use crate::observer::{NoopObserver, ProtocolObserver};
use crate::pinning::{CertificateValidator, DerValidator};
use crate::reporter::{ErrorHandler, ErrorReporter};
use crate::stats::ManagerStats;
use crate::timing::TimingPolicy;
use crate::transport::{ConnectionTransport, TransportEvent};

struct Settings {
    config: ClientConfig,
    log_sink: Option<Arc<dyn LogSink>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    frozen: bool,
}

/// Entry point for sync sessions.
pub struct SyncManager<T: ConnectionTransport> {
    transport: Arc<T>,
    settings: RwLock<Settings>,
    timing: Arc<RwLock<TimingPolicy>>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn ProtocolObserver>,
    validator: Arc<dyn CertificateValidator>,
    backoff: Arc<dyn ReconnectBackoff>,
    multiplexer: OnceLock<Arc<SessionMultiplexer<T>>>,
}

impl<T: ConnectionTransport> SyncManager<T> {
    /// Creates a manager.
    pub fn new(transport: T, config: ClientConfig) -> Self {
        let timing = Arc::new(RwLock::new(config.timing));
        Self {
            transport: Arc::new(transport),
            settings: RwLock::new(Settings {
                config,
                log_sink: None,
                error_handler: None,
                frozen: false,
            }),
            timing,
            clock: Arc::new(SystemClock),
            observer: Arc::new(NoopObserver),
            validator: Arc::new(DerValidator),
            backoff: Arc::new(ExponentialBackoff::default()),
            multiplexer: OnceLock::new(),
        }
    }

    /// Sets the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the protocol observer.
    pub fn with_observer(mut self, observer: Arc<dyn ProtocolObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Sets the certificate validator.
    pub fn with_validator(mut self, validator: Arc<dyn CertificateValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Sets the reconnect backoff policy.
    pub fn with_backoff(mut self, backoff: Arc<dyn ReconnectBackoff>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns a copy of the current configuration.
    pub fn config(&self) -> ClientConfig {
        let mut config = self.settings.read().config.clone();
        config.timing = *self.timing.read();
        config
    }

    /// Returns true once the first connection has been opened.
    pub fn is_frozen(&self) -> bool {
        self.settings.read().frozen
    }

    /// Sets the log level. Fails once a connection has been opened.
    pub fn set_log_level(&self, level: LogLevel) -> SyncResult<()> {
        self.update_frozen("log level", |s| s.config.log_level = level)
    }

    /// Installs a log sink replacing the `tracing` output. Fails once a
    /// connection has been opened.
    pub fn set_log_sink(&self, sink: Arc<dyn LogSink>) -> SyncResult<()> {
        self.update_frozen("log sink", |s| s.log_sink = Some(sink))
    }

    /// Installs the application error handler. Fails once a connection has
    /// been opened.
    pub fn set_error_handler(&self, handler: Arc<dyn ErrorHandler>) -> SyncResult<()> {
        self.update_frozen("error handler", |s| s.error_handler = Some(handler))
    }

    /// Replaces the timing policy for connections opened from now on.
    pub fn set_timing(&self, timing: TimingPolicy) {
        for warning in timing.validate() {
            tracing::warn!(target: "synclink", "{}", warning);
        }
        match self.multiplexer.get() {
            Some(multiplexer) => multiplexer.set_timing(timing),
            None => *self.timing.write() = timing,
        }
    }

    /// Sets the application identifier. Fails once a connection has been
    /// opened.
    pub fn set_app_id(&self, app_id: Option<String>) -> SyncResult<()> {
        self.update_frozen("app id", |s| s.config.app_id = app_id)
    }

    /// Sets the user agent. Fails once a connection has been opened.
    pub fn set_user_agent(&self, user_agent: Option<String>) -> SyncResult<()> {
        self.update_frozen("user agent", |s| s.config.user_agent = user_agent)
    }

    /// Sets the authorization header name.
    pub fn set_authorization_header_name(&self, name: Option<String>) {
        self.settings.write().config.authorization_header_name = name;
    }

    /// Replaces the custom request headers.
    pub fn set_custom_request_headers(&self, headers: BTreeMap<String, String>) {
        self.settings.write().config.custom_request_headers = headers;
    }

    /// Replaces the pinned certificate paths.
    pub fn set_pinned_certificate_paths(&self, paths: BTreeMap<String, PathBuf>) {
        self.settings.write().config.pinned_certificate_paths = paths;
    }

    /// Resolves the endpoint for a server address using the current
    /// configuration.
    pub fn endpoint(&self, host: &str, port: u16, tls: bool) -> Endpoint {
        self.settings.read().config.endpoint(host, port, tls)
    }

    /// Declares that `session` wants a connection to `endpoint`.
    pub fn register_interest(&self, session: SessionId, endpoint: &Endpoint) -> SyncResult<()> {
        self.multiplexer().register_interest(session, endpoint)
    }

    /// Withdraws `session`'s interest.
    pub fn deregister_interest(&self, session: SessionId) -> SyncResult<()> {
        match self.multiplexer.get() {
            Some(multiplexer) => multiplexer.deregister_interest(session),
            None => Err(SyncError::UnknownSession(session)),
        }
    }

    /// Reports that `session` has caught up with the server.
    pub fn download_complete(&self, session: SessionId) -> SyncResult<()> {
        match self.multiplexer.get() {
            Some(multiplexer) => multiplexer.download_complete(session),
            None => Err(SyncError::UnknownSession(session)),
        }
    }

    /// Applies a transport event.
    pub fn handle_transport_event(
        &self,
        handle: ConnectionHandle,
        event: TransportEvent,
    ) -> SyncResult<()> {
        match self.multiplexer.get() {
            Some(multiplexer) => multiplexer.handle_transport_event(handle, event),
            None => Err(SyncError::UnknownHandle(handle)),
        }
    }

    /// Reports a protocol-layer fault for one session.
    pub fn report_protocol_fault(
        &self,
        session: SessionId,
        kind: FaultKind,
        message: impl Into<String>,
    ) -> SyncResult<()> {
        match self.multiplexer.get() {
            Some(multiplexer) => multiplexer.report_protocol_fault(session, kind, message),
            None => Err(SyncError::UnknownSession(session)),
        }
    }

    /// Fires every due timer.
    pub fn poll_timers(&self) {
        if let Some(multiplexer) = self.multiplexer.get() {
            multiplexer.poll_timers();
        }
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.multiplexer.get().and_then(|m| m.next_deadline())
    }

    /// Closes every connection.
    pub fn shutdown(&self) {
        if let Some(multiplexer) = self.multiplexer.get() {
            multiplexer.shutdown();
        }
    }

    /// State of the endpoint's current connection.
    pub fn connection_state(&self, endpoint: &Endpoint) -> Option<ConnectionState> {
        self.multiplexer.get()?.connection_state(endpoint)
    }

    /// Snapshot of the endpoint's current connection.
    pub fn connection_info(&self, endpoint: &Endpoint) -> Option<ConnectionInfo> {
        self.multiplexer.get()?.connection_info(endpoint)
    }

    /// Number of live connections.
    pub fn live_connection_count(&self) -> usize {
        self.multiplexer
            .get()
            .map_or(0, |m| m.live_connection_count())
    }

    /// Activity counters.
    pub fn stats(&self) -> ManagerStats {
        self.multiplexer
            .get()
            .map(|m| m.stats())
            .unwrap_or_default()
    }

    /// Returns the multiplexer, building it (and freezing the logging and
    /// error handling settings) on first use.
    pub fn multiplexer(&self) -> &Arc<SessionMultiplexer<T>> {
        self.multiplexer.get_or_init(|| {
            let mut settings = self.settings.write();
            settings.frozen = true;

            let level = settings.config.log_level;
            let logger = match &settings.log_sink {
                Some(sink) => SyncLogger::with_sink(level, Arc::clone(sink)),
                None => SyncLogger::new(level),
            };
            let reporter = ErrorReporter::new(settings.error_handler.clone(), logger.clone());
            logger.info(|| {
                format!(
                    "sync manager started (log level {}, user agent {:?})",
                    level,
                    settings.config.effective_user_agent()
                )
            });

            Arc::new(
                SessionMultiplexer::with_shared_transport(Arc::clone(&self.transport))
                    .with_clock(Arc::clone(&self.clock))
                    .with_logger(logger)
                    .with_reporter(reporter)
                    .with_observer(Arc::clone(&self.observer))
                    .with_validator(Arc::clone(&self.validator))
                    .with_backoff(Arc::clone(&self.backoff))
                    .with_shared_timing(Arc::clone(&self.timing)),
            )
        })
    }

    fn update_frozen(
        &self,
        setting: &'static str,
        update: impl FnOnce(&mut Settings),
    ) -> SyncResult<()> {
        let mut settings = self.settings.write();
        if settings.frozen {
            return Err(SyncError::ConfigurationFrozen(setting));
        }
        update(&mut settings);
        Ok(())
    }
}

impl<T: ConnectionTransport + 'static> SyncManager<T> {
    /// Spawns a tokio task that fires timers as they come due.
    ///
    /// Pair with [`TokioClock`](crate::clock::TokioClock) or
    /// [`SystemClock`]; a manual clock never advances on its own.
    pub fn start_timer_driver(&self) -> TimerDriver {
        spawn_timer_driver(Arc::clone(self.multiplexer()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::MockTransport;

    fn manager() -> SyncManager<MockTransport> {
        SyncManager::new(MockTransport::new(), ClientConfig::new().with_app_id("tests"))
            .with_clock(Arc::new(ManualClock::new()))
    }

    #[test]
    fn logging_settings_freeze_at_first_open() {
        let manager = manager();
        manager.set_log_level(LogLevel::Debug).unwrap();
        manager
            .set_error_handler(Arc::new(|_: &crate::fault::FaultRecord, _: Option<SessionId>| {}))
            .unwrap();
        assert!(!manager.is_frozen());

        let endpoint = manager.endpoint("sync.example.com", 443, true);
        manager
            .register_interest(SessionId::from_u128(1), &endpoint)
            .unwrap();

        assert!(manager.is_frozen());
        assert!(matches!(
            manager.set_log_level(LogLevel::Trace),
            Err(SyncError::ConfigurationFrozen("log level"))
        ));
        assert!(matches!(
            manager.set_log_sink(Arc::new(|_: LogLevel, _: &str| {})),
            Err(SyncError::ConfigurationFrozen("log sink"))
        ));
        assert_eq!(manager.config().log_level, LogLevel::Debug);
    }

    #[test]
    fn timing_changes_apply_to_later_attempts() {
        let manager = manager();
        let endpoint = manager.endpoint("sync.example.com", 443, true);
        manager
            .register_interest(SessionId::from_u128(1), &endpoint)
            .unwrap();

        let faster = TimingPolicy::new().with_connect_timeout(std::time::Duration::from_secs(5));
        manager.set_timing(faster);

        assert_eq!(manager.config().timing, faster);
        let requests = manager.transport().open_requests();
        assert_eq!(requests[0].timing, TimingPolicy::default());
    }

    #[test]
    fn endpoint_carries_user_agent() {
        let manager = manager();
        manager.set_user_agent(Some("notes/1.0".into())).unwrap();
        let endpoint = manager.endpoint("sync.example.com", 443, true);
        assert_eq!(
            endpoint.headers.get("User-Agent").map(String::as_str),
            Some("tests notes/1.0")
        );
    }

    #[test]
    fn user_agent_freezes_at_first_open() {
        let manager = manager();
        manager.set_user_agent(Some("b/1".into())).unwrap();
        let endpoint = manager.endpoint("sync.example.com", 443, true);
        manager
            .register_interest(SessionId::from_u128(1), &endpoint)
            .unwrap();

        assert!(matches!(
            manager.set_user_agent(Some("b/2".into())),
            Err(SyncError::ConfigurationFrozen("user agent"))
        ));
        assert!(matches!(
            manager.set_app_id(Some("other".into())),
            Err(SyncError::ConfigurationFrozen("app id"))
        ));

        let later = manager.endpoint("sync.example.com", 443, true);
        assert_eq!(
            later.headers.get("User-Agent").map(String::as_str),
            Some("tests b/1")
        );
        assert_eq!(later, endpoint);
    }

    #[test]
    fn calls_before_first_open_are_rejected() {
        let manager = manager();
        let session = SessionId::from_u128(1);
        assert!(matches!(
            manager.deregister_interest(session),
            Err(SyncError::UnknownSession(_))
        ));
        assert_eq!(manager.live_connection_count(), 0);
        assert_eq!(manager.stats(), ManagerStats::default());
        assert!(manager.next_deadline().is_none());
    }
}
