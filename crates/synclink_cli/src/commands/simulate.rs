//! Simulate command implementation.
//!
//! Replays a JSON timeline of session and transport events against a
//! [`SyncManager`] backed by the mock transport and a manual clock. Timers
//! fire at their exact deadlines between events, so the output is
//! deterministic.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use synclink_core::{
    ClientConfig, Endpoint, ExponentialBackoff, FaultKind, FaultRecord, InboundFrame, LogLevel,
    ManagerStats, ManualClock, MockTransport, ProtocolObserver, SessionId, StateChange, SyncError,
    SyncManager, TransportEvent,
};

/// Upper bound on timer steps between two events.
const MAX_TIMER_STEPS: usize = 100_000;

/// A scripted run.
#[derive(Debug, Deserialize)]
pub struct Timeline {
    /// Client configuration.
    #[serde(default)]
    pub config: ClientConfig,
    /// Reconnect backoff, without jitter.
    #[serde(default)]
    pub backoff: BackoffSpec,
    /// Events in time order.
    pub events: Vec<TimedEvent>,
    /// Keep firing timers until this time after the last event.
    #[serde(default)]
    pub until_ms: Option<u64>,
}

/// Backoff parameters for a simulation.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BackoffSpec {
    /// Delay before the second attempt.
    pub initial_ms: u64,
    /// Delay cap.
    pub max_ms: u64,
}

impl Default for BackoffSpec {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 300_000,
        }
    }
}

/// One scripted event.
#[derive(Debug, Clone, Deserialize)]
pub struct TimedEvent {
    /// Time of the event, in ms from the start of the run.
    pub at_ms: u64,
    /// What happens.
    #[serde(flatten)]
    pub action: Action,
}

/// Scripted inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// A session registers interest in an endpoint.
    Register {
        /// Session name.
        session: String,
        /// Endpoint URL, e.g. `wss://sync.example.com:443`.
        endpoint: String,
    },
    /// A session withdraws its interest.
    Deregister {
        /// Session name.
        session: String,
    },
    /// A session's download caught up.
    DownloadComplete {
        /// Session name.
        session: String,
    },
    /// The protocol layer hit a fatal error for one session.
    SessionFatal {
        /// Session name.
        session: String,
        /// Error description.
        message: String,
    },
    /// The transport finished the handshake.
    Handshake {
        /// Endpoint URL.
        endpoint: String,
    },
    /// A pong arrived.
    Pong {
        /// Endpoint URL.
        endpoint: String,
    },
    /// The channel dropped.
    Disconnect {
        /// Endpoint URL.
        endpoint: String,
        /// Transport-provided reason.
        #[serde(default = "default_reason")]
        reason: String,
    },
    /// The server refused the client.
    Reject {
        /// Endpoint URL.
        endpoint: String,
        /// Server-provided reason.
        #[serde(default = "default_reason")]
        reason: String,
    },
    /// Only fire timers up to this time.
    Tick,
}

fn default_reason() -> String {
    "unspecified".to_string()
}

/// A state transition seen during the run.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionEntry {
    /// Time of the transition.
    pub at_ms: u64,
    /// Connection number.
    pub connection: u64,
    /// Endpoint URL.
    pub endpoint: String,
    /// Previous state.
    pub from: synclink_core::ConnectionState,
    /// New state.
    pub to: synclink_core::ConnectionState,
    /// Whether uploads are allowed afterwards.
    pub upload_enabled: bool,
}

/// A fault delivered to the error handler.
#[derive(Debug, Clone, Serialize)]
pub struct FaultEntry {
    /// Time of delivery.
    pub at_ms: u64,
    /// Fault kind.
    pub kind: String,
    /// Description.
    pub message: String,
    /// Connection number.
    pub connection: u64,
    /// Per-connection sequence.
    pub sequence: u64,
    /// Sessions terminated by the fault.
    pub terminated: usize,
}

/// A scripted event the manager refused.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedEntry {
    /// Time of the event.
    pub at_ms: u64,
    /// The event.
    pub action: Action,
    /// Why it was refused.
    pub error: String,
}

/// Outcome of a simulation.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    /// Time the run stopped.
    pub end_ms: u64,
    /// Every state transition, in order.
    pub transitions: Vec<TransitionEntry>,
    /// Every fault, in delivery order.
    pub faults: Vec<FaultEntry>,
    /// Events that returned an error.
    pub rejected: Vec<RejectedEntry>,
    /// Final state per endpoint.
    pub final_states: BTreeMap<String, synclink_core::ConnectionState>,
    /// Channels opened on the mock transport.
    pub channels_opened: usize,
    /// Pings written.
    pub pings_sent: usize,
    /// Manager counters.
    pub stats: ManagerStats,
}

struct TimelineObserver {
    clock: Arc<ManualClock>,
    transitions: Mutex<Vec<TransitionEntry>>,
}

impl ProtocolObserver for TimelineObserver {
    fn on_state_change(&self, change: &StateChange) {
        self.transitions.lock().push(TransitionEntry {
            at_ms: self.clock.elapsed_ms(),
            connection: change.connection.0,
            endpoint: change.endpoint.to_string(),
            from: change.from,
            to: change.to,
            upload_enabled: change.upload_enabled,
        });
    }
}

/// Runs the simulate command.
pub fn run(
    path: &Path,
    log_level: Option<LogLevel>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let mut timeline: Timeline = serde_json::from_str(&text)?;
    if let Some(level) = log_level {
        timeline.config.log_level = level;
    }

    let report = simulate(&timeline)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_report(path, &report),
    }

    Ok(())
}

/// Replays a timeline and collects what happened.
pub fn simulate(timeline: &Timeline) -> Result<SimulationReport, Box<dyn std::error::Error>> {
    let clock = Arc::new(ManualClock::new());
    let observer = Arc::new(TimelineObserver {
        clock: Arc::clone(&clock),
        transitions: Mutex::new(Vec::new()),
    });
    let faults = Arc::new(Mutex::new(Vec::new()));

    let backoff = ExponentialBackoff::new(
        Duration::from_millis(timeline.backoff.initial_ms),
        Duration::from_millis(timeline.backoff.max_ms),
    )
    .with_jitter(false);

    let manager = SyncManager::new(MockTransport::new(), timeline.config.clone())
        .with_clock(clock.clone())
        .with_observer(observer.clone())
        .with_backoff(Arc::new(backoff));

    let sink = Arc::clone(&faults);
    let fault_clock = Arc::clone(&clock);
    manager.set_error_handler(Arc::new(
        move |fault: &FaultRecord, _session: Option<SessionId>| {
            sink.lock().push(FaultEntry {
                at_ms: fault_clock.elapsed_ms(),
                kind: fault.kind.to_string(),
                message: fault.message.clone(),
                connection: fault.connection.0,
                sequence: fault.sequence,
                terminated: fault.affected_sessions.len(),
            });
        },
    ))?;

    let mut sessions = SessionNames::default();
    let mut endpoints: BTreeMap<String, Endpoint> = BTreeMap::new();
    let mut rejected = Vec::new();

    for event in &timeline.events {
        run_timers_until(&manager, &clock, event.at_ms);
        clock.set_ms(event.at_ms);

        if let Err(error) = apply(&manager, &mut sessions, &mut endpoints, &event.action) {
            rejected.push(RejectedEntry {
                at_ms: clock.elapsed_ms(),
                action: event.action.clone(),
                error: error.to_string(),
            });
        }
    }

    if let Some(until) = timeline.until_ms {
        run_timers_until(&manager, &clock, until);
        clock.set_ms(until);
        manager.poll_timers();
    }

    let final_states = endpoints
        .iter()
        .filter_map(|(name, endpoint)| {
            manager
                .connection_state(endpoint)
                .map(|state| (name.clone(), state))
        })
        .collect();

    let transitions = observer.transitions.lock().clone();
    let faults = faults.lock().clone();

    Ok(SimulationReport {
        end_ms: clock.elapsed_ms(),
        transitions,
        faults,
        rejected,
        final_states,
        channels_opened: manager.transport().open_count(),
        pings_sent: manager.transport().ping_count(),
        stats: manager.stats(),
    })
}

/// Fires every deadline up to and including `until_ms`, one at a time.
fn run_timers_until(manager: &SyncManager<MockTransport>, clock: &ManualClock, until_ms: u64) {
    let mut previous: Option<Instant> = None;
    for _ in 0..MAX_TIMER_STEPS {
        let Some(deadline) = manager.next_deadline() else {
            return;
        };
        // A deadline that survives its own poll would spin forever.
        if previous == Some(deadline) {
            return;
        }
        let due_ms = millis_since(clock.origin(), deadline).max(clock.elapsed_ms());
        if due_ms > until_ms {
            return;
        }
        clock.set_ms(due_ms);
        manager.poll_timers();
        previous = Some(deadline);
    }
    tracing::warn!("timer step limit reached before {} ms", until_ms);
}

fn millis_since(origin: Instant, deadline: Instant) -> u64 {
    let elapsed = deadline.saturating_duration_since(origin);
    // Round up so the poll happens at or after the deadline.
    let millis = elapsed.as_nanos().div_ceil(1_000_000);
    u64::try_from(millis).unwrap_or(u64::MAX)
}

fn apply(
    manager: &SyncManager<MockTransport>,
    sessions: &mut SessionNames,
    endpoints: &mut BTreeMap<String, Endpoint>,
    action: &Action,
) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        Action::Register { session, endpoint } => {
            let target = resolve(manager, endpoints, endpoint)?;
            manager.register_interest(sessions.id(session), &target)?;
        }
        Action::Deregister { session } => {
            manager.deregister_interest(sessions.id(session))?;
        }
        Action::DownloadComplete { session } => {
            manager.download_complete(sessions.id(session))?;
        }
        Action::SessionFatal { session, message } => {
            manager.report_protocol_fault(
                sessions.id(session),
                FaultKind::ProtocolFatal,
                message.clone(),
            )?;
        }
        Action::Handshake { endpoint } => {
            deliver(manager, endpoints, endpoint, TransportEvent::HandshakeCompleted)?;
        }
        Action::Pong { endpoint } => {
            // The mock transport does not echo sequences; any pong answers
            // the outstanding probe.
            deliver(
                manager,
                endpoints,
                endpoint,
                TransportEvent::Frame(InboundFrame::Pong { sequence: 0 }),
            )?;
        }
        Action::Disconnect { endpoint, reason } => {
            deliver(
                manager,
                endpoints,
                endpoint,
                TransportEvent::Disconnected {
                    reason: reason.clone(),
                },
            )?;
        }
        Action::Reject { endpoint, reason } => {
            deliver(
                manager,
                endpoints,
                endpoint,
                TransportEvent::Rejected {
                    reason: reason.clone(),
                },
            )?;
        }
        Action::Tick => manager.poll_timers(),
    }
    Ok(())
}

fn resolve(
    manager: &SyncManager<MockTransport>,
    endpoints: &mut BTreeMap<String, Endpoint>,
    url: &str,
) -> Result<Endpoint, Box<dyn std::error::Error>> {
    if let Some(endpoint) = endpoints.get(url) {
        return Ok(endpoint.clone());
    }
    let (host, port, tls) = parse_endpoint(url)?;
    let endpoint = manager.endpoint(&host, port, tls);
    endpoints.insert(url.to_string(), endpoint.clone());
    Ok(endpoint)
}

fn deliver(
    manager: &SyncManager<MockTransport>,
    endpoints: &BTreeMap<String, Endpoint>,
    url: &str,
    event: TransportEvent,
) -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = endpoints
        .get(url)
        .ok_or_else(|| format!("no session has used {}", url))?;
    let handle = manager
        .connection_info(endpoint)
        .and_then(|info| info.handle)
        .ok_or_else(|| format!("{} has no open channel", url))?;
    manager.handle_transport_event(handle, event)?;
    Ok(())
}

/// Parses `ws://host[:port]` or `wss://host[:port]`.
pub fn parse_endpoint(url: &str) -> Result<(String, u16, bool), SyncError> {
    let invalid = || SyncError::Configuration(format!("invalid endpoint URL: {url}"));

    let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
    let tls = match scheme {
        "wss" => true,
        "ws" => false,
        _ => return Err(invalid()),
    };
    let rest = rest.trim_end_matches('/');

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
        None => (rest, if tls { 443 } else { 80 }),
    };
    if host.is_empty() {
        return Err(invalid());
    }

    Ok((host.to_string(), port, tls))
}

/// Maps session names in the timeline to stable identifiers.
#[derive(Default)]
struct SessionNames {
    ids: HashMap<String, SessionId>,
}

impl SessionNames {
    fn id(&mut self, name: &str) -> SessionId {
        let next = self.ids.len() as u128 + 1;
        *self
            .ids
            .entry(name.to_string())
            .or_insert_with(|| SessionId::from_u128(next))
    }
}

fn print_report(path: &Path, report: &SimulationReport) {
    println!("Simulating {:?}", path);
    println!();

    println!("Transitions:");
    for t in &report.transitions {
        println!(
            "  {:>8} ms  conn#{:<3} {:<28} {} -> {}{}",
            t.at_ms,
            t.connection,
            t.endpoint,
            t.from,
            t.to,
            if t.upload_enabled { " (upload)" } else { "" }
        );
    }

    if !report.faults.is_empty() {
        println!();
        println!("Faults:");
        for f in &report.faults {
            println!(
                "  {:>8} ms  conn#{:<3} #{} {}: {}",
                f.at_ms, f.connection, f.sequence, f.kind, f.message
            );
        }
    }

    if !report.rejected.is_empty() {
        println!();
        println!("Rejected events:");
        for r in &report.rejected {
            println!("  {:>8} ms  {:?}: {}", r.at_ms, r.action, r.error);
        }
    }

    println!();
    println!("Final states:");
    for (endpoint, state) in &report.final_states {
        println!("  {:<30} {}", endpoint, state);
    }

    println!();
    println!("Channels opened:        {}", report.channels_opened);
    println!("Pings sent:             {}", report.pings_sent);
    println!("Handshakes:             {}", report.stats.handshakes_completed);
    println!("Fast reconnects:        {}", report.stats.fast_reconnects);
    println!("Faults reported:        {}", report.stats.faults_reported);
    println!("Ended at:               {} ms", report.end_ms);
}

#[cfg(test)]
mod tests {
    use super::*;
    use synclink_core::ConnectionState;

    const WORKED: &str = r#"{
        "config": {
            "log_level": "off",
            "timing": {
                "connect_timeout_ms": 5000,
                "connection_linger_time_ms": 3000,
                "ping_keepalive_period_ms": 1000,
                "pong_keepalive_timeout_ms": 200,
                "fast_reconnect_limit_ms": 2000
            }
        },
        "events": [
            { "at_ms": 0, "action": "register", "session": "a", "endpoint": "wss://sync.example.com:443" },
            { "at_ms": 100, "action": "handshake", "endpoint": "wss://sync.example.com:443" },
            { "at_ms": 150, "action": "download_complete", "session": "a" },
            { "at_ms": 400, "action": "deregister", "session": "a" },
            { "at_ms": 1000, "action": "register", "session": "b", "endpoint": "wss://sync.example.com:443" },
            { "at_ms": 1100, "action": "pong", "endpoint": "wss://sync.example.com:443" },
            { "at_ms": 2100, "action": "pong", "endpoint": "wss://sync.example.com:443" },
            { "at_ms": 3100, "action": "pong", "endpoint": "wss://sync.example.com:443" },
            { "at_ms": 4100, "action": "pong", "endpoint": "wss://sync.example.com:443" },
            { "at_ms": 5000, "action": "disconnect", "endpoint": "wss://sync.example.com:443", "reason": "reset" },
            { "at_ms": 6500, "action": "handshake", "endpoint": "wss://sync.example.com:443" }
        ]
    }"#;

    #[test]
    fn parse_endpoint_urls() {
        assert_eq!(
            parse_endpoint("wss://sync.example.com:8443").unwrap(),
            ("sync.example.com".to_string(), 8443, true)
        );
        assert_eq!(
            parse_endpoint("ws://localhost").unwrap(),
            ("localhost".to_string(), 80, false)
        );
        assert!(parse_endpoint("http://example.com").is_err());
        assert!(parse_endpoint("wss://:443").is_err());
        assert!(parse_endpoint("wss://host:port").is_err());
    }

    #[test]
    fn worked_timeline_ends_active() {
        let timeline: Timeline = serde_json::from_str(WORKED).unwrap();
        let report = simulate(&timeline).unwrap();

        assert!(report.rejected.is_empty(), "{:?}", report.rejected);
        assert_eq!(
            report.final_states.get("wss://sync.example.com:443"),
            Some(&ConnectionState::Active)
        );
        assert_eq!(report.channels_opened, 2);
        assert_eq!(report.pings_sent, 4);
        assert_eq!(report.stats.fast_reconnects, 1);
        assert_eq!(report.faults.len(), 1);
        assert_eq!(report.faults[0].kind, "transport_error");
        assert_eq!(report.faults[0].at_ms, 5000);
    }

    #[test]
    fn unanswered_ping_times_out() {
        let timeline: Timeline = serde_json::from_str(
            r#"{
                "config": {
                    "log_level": "off",
                    "timing": { "ping_keepalive_period_ms": 1000, "pong_keepalive_timeout_ms": 300 }
                },
                "backoff": { "initial_ms": 100, "max_ms": 1000 },
                "events": [
                    { "at_ms": 0, "action": "register", "session": "a", "endpoint": "ws://localhost:9090" },
                    { "at_ms": 10, "action": "handshake", "endpoint": "ws://localhost:9090" }
                ],
                "until_ms": 1500
            }"#,
        )
        .unwrap();
        let report = simulate(&timeline).unwrap();

        assert_eq!(report.faults.len(), 1);
        assert_eq!(report.faults[0].kind, "heartbeat_timeout");
        assert_eq!(report.faults[0].at_ms, 1310);
        assert_eq!(
            report.final_states.get("ws://localhost:9090"),
            Some(&ConnectionState::Connecting)
        );
        assert_eq!(report.channels_opened, 2);
    }

    #[test]
    fn events_for_unknown_channels_are_rejected() {
        let timeline: Timeline = serde_json::from_str(
            r#"{
                "events": [
                    { "at_ms": 0, "action": "handshake", "endpoint": "wss://sync.example.com" },
                    { "at_ms": 5, "action": "deregister", "session": "ghost" }
                ]
            }"#,
        )
        .unwrap();
        let report = simulate(&timeline).unwrap();
        assert_eq!(report.rejected.len(), 2);
        assert!(report.transitions.is_empty());
    }
}
