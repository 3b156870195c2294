//! Property tests over random interleavings of interest changes, transport
//! events and time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;
use synclink_core::{
    ConnectionId, ConnectionState, Endpoint, ErrorReporter, ExponentialBackoff, FaultRecord,
    InboundFrame, LogLevel, ManualClock, MockTransport, RecordingObserver, SessionId,
    SessionMultiplexer, SyncLogger, TimingPolicy, TransportEvent,
};

#[derive(Debug, Clone)]
enum Op {
    Register(u8, bool),
    Deregister(u8),
    DownloadComplete(u8),
    Advance(u64),
    Handshake(bool),
    Pong(bool),
    Disconnect(bool),
    Reject(bool),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..6, any::<bool>()).prop_map(|(s, e)| Op::Register(s, e)),
        2 => (0u8..6).prop_map(Op::Deregister),
        1 => (0u8..6).prop_map(Op::DownloadComplete),
        3 => (1u64..1500).prop_map(Op::Advance),
        2 => any::<bool>().prop_map(Op::Handshake),
        1 => any::<bool>().prop_map(Op::Pong),
        1 => any::<bool>().prop_map(Op::Disconnect),
        1 => any::<bool>().prop_map(Op::Reject),
    ]
}

fn endpoint(second: bool) -> Endpoint {
    if second {
        Endpoint::new("b.example.com", 443, true)
    } else {
        Endpoint::new("a.example.com", 443, true)
    }
}

struct World {
    clock: Arc<ManualClock>,
    mux: SessionMultiplexer<MockTransport>,
    faults: Arc<Mutex<Vec<FaultRecord>>>,
    observer: Arc<RecordingObserver>,
    now_ms: u64,
}

impl World {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new());
        let faults = Arc::new(Mutex::new(Vec::new()));
        let observer = Arc::new(RecordingObserver::new());
        let sink = Arc::clone(&faults);
        let handler = move |fault: &FaultRecord, _: Option<SessionId>| sink.lock().push(fault.clone());

        let mux = SessionMultiplexer::new(MockTransport::new())
            .with_clock(clock.clone())
            .with_observer(observer.clone())
            .with_reporter(ErrorReporter::new(
                Some(Arc::new(handler)),
                SyncLogger::new(LogLevel::Off),
            ))
            .with_backoff(Arc::new(
                ExponentialBackoff::new(Duration::from_millis(50), Duration::from_millis(400))
                    .with_jitter(false),
            ))
            .with_timing(
                TimingPolicy::new()
                    .with_connect_timeout(Duration::from_millis(800))
                    .with_connection_linger_time(Duration::from_millis(600))
                    .with_ping_keepalive_period(Duration::from_millis(500))
                    .with_pong_keepalive_timeout(Duration::from_millis(300))
                    .with_fast_reconnect_limit(Duration::from_millis(1000)),
            );

        Self {
            clock,
            mux,
            faults,
            observer,
            now_ms: 0,
        }
    }

    fn event(&self, second: bool, event: TransportEvent) {
        let handle = self
            .mux
            .connection_info(&endpoint(second))
            .and_then(|info| info.handle);
        if let Some(handle) = handle {
            // Random ops hit wrong states; errors are fine here.
            let _ = self.mux.handle_transport_event(handle, event);
        }
    }

    fn apply(&mut self, op: Op) {
        match op {
            Op::Register(s, e) => {
                let _ = self
                    .mux
                    .register_interest(SessionId::from_u128(u128::from(s) + 1), &endpoint(e));
            }
            Op::Deregister(s) => {
                let _ = self
                    .mux
                    .deregister_interest(SessionId::from_u128(u128::from(s) + 1));
            }
            Op::DownloadComplete(s) => {
                let _ = self
                    .mux
                    .download_complete(SessionId::from_u128(u128::from(s) + 1));
            }
            Op::Advance(ms) => {
                self.now_ms += ms;
                self.clock.set_ms(self.now_ms);
                self.mux.poll_timers();
            }
            Op::Handshake(e) => self.event(e, TransportEvent::HandshakeCompleted),
            Op::Pong(e) => self.event(e, TransportEvent::Frame(InboundFrame::Pong { sequence: 0 })),
            Op::Disconnect(e) => self.event(
                e,
                TransportEvent::Disconnected {
                    reason: "reset".into(),
                },
            ),
            Op::Reject(e) => self.event(
                e,
                TransportEvent::Rejected {
                    reason: "denied".into(),
                },
            ),
        }
    }

    /// Connections per endpoint currently in a live, non-idle state,
    /// reconstructed from observed transitions.
    fn live_per_endpoint(&self) -> HashMap<Endpoint, usize> {
        let mut latest: HashMap<ConnectionId, (Endpoint, ConnectionState)> = HashMap::new();
        for change in self.observer.changes() {
            latest.insert(change.connection, (change.endpoint, change.to));
        }
        let mut live = HashMap::new();
        for (endpoint, state) in latest.into_values() {
            if matches!(
                state,
                ConnectionState::Connecting
                    | ConnectionState::SuspendedUpload
                    | ConnectionState::Active
                    | ConnectionState::Lingering
            ) {
                *live.entry(endpoint).or_insert(0) += 1;
            }
        }
        live
    }
}

proptest! {
    #[test]
    fn at_most_one_live_connection_per_endpoint(ops in prop::collection::vec(op(), 1..80)) {
        let mut world = World::new();
        for op in ops {
            world.apply(op);
            for (endpoint, count) in world.live_per_endpoint() {
                prop_assert!(count <= 1, "{} has {} live connections", endpoint, count);
            }
            prop_assert!(world.mux.live_connection_count() <= 2);
        }
    }

    #[test]
    fn faults_arrive_in_generation_order(ops in prop::collection::vec(op(), 1..80)) {
        let mut world = World::new();
        for op in ops {
            world.apply(op);
        }

        let mut last: HashMap<ConnectionId, u64> = HashMap::new();
        for fault in world.faults.lock().iter() {
            let previous = last.insert(fault.connection, fault.sequence).unwrap_or(0);
            prop_assert_eq!(fault.sequence, previous + 1);
        }
    }

    #[test]
    fn heartbeat_timeouts_match_reports(ops in prop::collection::vec(op(), 1..80)) {
        let mut world = World::new();
        for op in ops {
            world.apply(op);
        }

        let reported = world
            .faults
            .lock()
            .iter()
            .filter(|f| f.kind == synclink_core::FaultKind::HeartbeatTimeout)
            .count() as u64;
        prop_assert_eq!(reported, world.mux.stats().heartbeat_timeouts);
    }
}
