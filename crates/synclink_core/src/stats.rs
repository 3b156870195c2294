//! Connection manager statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters describing connection activity since the manager started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    /// Connection instances created (including reconnect successors).
    pub connections_created: u64,
    /// Calls to the transport's `open`.
    pub connect_attempts: u64,
    /// Successful handshakes.
    pub handshakes_completed: u64,
    /// Handshakes classified as fast reconnects.
    pub fast_reconnects: u64,
    /// Handshakes that exceeded the connect timeout.
    pub connect_timeouts: u64,
    /// Connections declared dead by the heartbeat.
    pub heartbeat_timeouts: u64,
    /// Channels lost or refused by the transport.
    pub transport_failures: u64,
    /// Pings written.
    pub pings_sent: u64,
    /// Fault records handed to the error reporter.
    pub faults_reported: u64,
    /// Sessions terminated by fatal errors.
    pub sessions_terminated: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    connections_created: AtomicU64,
    connect_attempts: AtomicU64,
    handshakes_completed: AtomicU64,
    fast_reconnects: AtomicU64,
    connect_timeouts: AtomicU64,
    heartbeat_timeouts: AtomicU64,
    transport_failures: AtomicU64,
    pings_sent: AtomicU64,
    faults_reported: AtomicU64,
    sessions_terminated: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl StatsRecorder {
    pub fn connection_created(&self) {
        bump(&self.connections_created, 1);
    }

    pub fn connect_attempt(&self) {
        bump(&self.connect_attempts, 1);
    }

    pub fn handshake_completed(&self, fast: bool) {
        bump(&self.handshakes_completed, 1);
        if fast {
            bump(&self.fast_reconnects, 1);
        }
    }

    pub fn connect_timeout(&self) {
        bump(&self.connect_timeouts, 1);
    }

    pub fn heartbeat_timeout(&self) {
        bump(&self.heartbeat_timeouts, 1);
    }

    pub fn transport_failure(&self) {
        bump(&self.transport_failures, 1);
    }

    pub fn ping_sent(&self) {
        bump(&self.pings_sent, 1);
    }

    pub fn fault_reported(&self) {
        bump(&self.faults_reported, 1);
    }

    pub fn sessions_terminated(&self, count: usize) {
        bump(&self.sessions_terminated, count as u64);
    }

    pub fn snapshot(&self) -> ManagerStats {
        ManagerStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            handshakes_completed: self.handshakes_completed.load(Ordering::Relaxed),
            fast_reconnects: self.fast_reconnects.load(Ordering::Relaxed),
            connect_timeouts: self.connect_timeouts.load(Ordering::Relaxed),
            heartbeat_timeouts: self.heartbeat_timeouts.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            faults_reported: self.faults_reported.load(Ordering::Relaxed),
            sessions_terminated: self.sessions_terminated.load(Ordering::Relaxed),
        }
    }
}
