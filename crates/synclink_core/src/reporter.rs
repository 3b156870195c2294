//! Error reporting to the application.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::endpoint::SessionId;
use crate::fault::FaultRecord;
use crate::logging::SyncLogger;

/// Application callback for sync faults.
///
/// Called synchronously on the thread that produced the fault, possibly from
/// several connections at once, after the endpoint lock has been released.
/// Faults from one input arrive in the order they were raised.
/// Implementations synchronize their own state. Calling back into the
/// manager (querying state, deregistering a session) is allowed; long work
/// belongs on another task (see [`FaultChannel`]).
pub trait ErrorHandler: Send + Sync {
    /// Handles one fault. `session` is the originating session, if any.
    fn on_fault(&self, fault: &FaultRecord, session: Option<SessionId>);
}

impl<F> ErrorHandler for F
where
    F: Fn(&FaultRecord, Option<SessionId>) + Send + Sync,
{
    fn on_fault(&self, fault: &FaultRecord, session: Option<SessionId>) {
        self(fault, session)
    }
}

/// An error handler that forwards faults to an unbounded channel.
#[derive(Debug, Clone)]
pub struct FaultChannel {
    tx: mpsc::UnboundedSender<FaultRecord>,
}

impl FaultChannel {
    /// Creates a handler and the receiver its faults arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FaultRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ErrorHandler for FaultChannel {
    fn on_fault(&self, fault: &FaultRecord, _session: Option<SessionId>) {
        let _ = self.tx.send(fault.clone());
    }
}

/// Logs and forwards fault records.
///
/// No queuing, batching or deduplication: each call to
/// [`report`](Self::report) reaches the handler exactly once, before
/// `report` returns.
#[derive(Clone, Default)]
pub struct ErrorReporter {
    handler: Option<Arc<dyn ErrorHandler>>,
    logger: SyncLogger,
}

impl ErrorReporter {
    /// Creates a reporter.
    pub fn new(handler: Option<Arc<dyn ErrorHandler>>, logger: SyncLogger) -> Self {
        Self { handler, logger }
    }

    /// Returns true if an application handler is installed.
    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Logs the record at its severity and hands it to the handler.
    pub fn report(&self, record: &FaultRecord) {
        self.logger.log(record.severity, || record.to_string());
        if let Some(handler) = &self.handler {
            handler.on_fault(record, record.session);
        }
    }
}

impl fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("handler", &self.handler.is_some())
            .field("logger", &self.logger)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{ConnectionId, Endpoint};
    use crate::fault::FaultKind;
    use crate::logging::{ChannelLogSink, LogLevel};
    use parking_lot::Mutex;

    fn record(sequence: u64, session: Option<SessionId>) -> FaultRecord {
        FaultRecord {
            kind: FaultKind::ConnectTimeout,
            severity: LogLevel::Warn,
            message: "timed out".into(),
            session,
            affected_sessions: Vec::new(),
            connection: ConnectionId(1),
            endpoint: Endpoint::new("localhost", 9080, false),
            sequence,
        }
    }

    #[test]
    fn forwards_with_session() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        let handler = move |fault: &FaultRecord, session: Option<SessionId>| {
            captured.lock().push((fault.sequence, session));
        };
        let reporter = ErrorReporter::new(Some(Arc::new(handler)), SyncLogger::new(LogLevel::Off));

        let session = SessionId::from_u128(9);
        reporter.report(&record(1, None));
        reporter.report(&record(2, Some(session)));

        assert_eq!(*seen.lock(), vec![(1, None), (2, Some(session))]);
    }

    #[test]
    fn logs_at_record_severity() {
        let (sink, mut logs) = ChannelLogSink::new();
        let logger = SyncLogger::with_sink(LogLevel::Warn, Arc::new(sink));
        let reporter = ErrorReporter::new(None, logger);

        reporter.report(&record(1, None));

        let log = logs.try_recv().unwrap();
        assert_eq!(log.level, LogLevel::Warn);
        assert!(log.message.contains("connect_timeout"));
    }

    #[test]
    fn fault_channel_preserves_order() {
        let (handler, mut rx) = FaultChannel::new();
        let reporter = ErrorReporter::new(Some(Arc::new(handler)), SyncLogger::new(LogLevel::Off));

        for sequence in 1..=5 {
            reporter.report(&record(sequence, None));
        }

        let received: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|r| r.sequence)
            .collect();
        assert_eq!(received, vec![1, 2, 3, 4, 5]);
    }
}
