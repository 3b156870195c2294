//! Heartbeat monitor.
//!
//! Ping ticks run on a fixed phase starting at [`HeartbeatMonitor::start`]:
//! tick `n` is due at `start + n * period` no matter when pongs arrive. Each
//! ping arms a pong deadline. A tick that comes due while a ping is still
//! unanswered is skipped, so probes never overlap even when the pong timeout
//! is longer than the period.
//!
//! The monitor holds no timers of its own. The owning connection calls
//! [`HeartbeatMonitor::poll`] whenever [`HeartbeatMonitor::next_deadline`]
//! has passed.

use std::time::{Duration, Instant};

/// What the connection has to do after a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Nothing is due.
    Idle,
    /// Send a PING now.
    SendPing,
    /// The outstanding PING was not answered in time.
    Dead,
}

#[derive(Debug, Clone, Copy)]
struct Probe {
    sent_at: Instant,
    deadline: Instant,
}

/// Ping/pong liveness tracking for one connection.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    period: Duration,
    timeout: Duration,
    running: bool,
    next_ping: Option<Instant>,
    outstanding: Option<Probe>,
    pings_sent: u64,
    last_round_trip: Option<Duration>,
}

impl HeartbeatMonitor {
    /// Creates a stopped monitor.
    pub fn new(period: Duration, timeout: Duration) -> Self {
        Self {
            period,
            timeout,
            running: false,
            next_ping: None,
            outstanding: None,
            pings_sent: 0,
            last_round_trip: None,
        }
    }

    /// Starts probing; the first ping is due one period from `now`.
    ///
    /// A zero period leaves the monitor stopped.
    pub fn start(&mut self, now: Instant) {
        self.outstanding = None;
        if self.period.is_zero() {
            self.running = false;
            self.next_ping = None;
            return;
        }
        self.running = true;
        self.next_ping = Some(now + self.period);
    }

    /// Stops probing and cancels every pending deadline.
    pub fn stop(&mut self) {
        self.running = false;
        self.next_ping = None;
        self.outstanding = None;
    }

    /// Returns true while probing.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Returns true while a ping is waiting for its pong.
    pub fn awaiting_pong(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Number of pings sent since creation.
    pub fn pings_sent(&self) -> u64 {
        self.pings_sent
    }

    /// Round trip of the most recently answered ping.
    pub fn last_round_trip(&self) -> Option<Duration> {
        self.last_round_trip
    }

    /// Records a pong. Returns false if no ping was outstanding.
    ///
    /// The next tick keeps its original schedule.
    pub fn on_pong(&mut self, now: Instant) -> bool {
        match self.outstanding.take() {
            Some(probe) if self.running => {
                self.last_round_trip = Some(now.saturating_duration_since(probe.sent_at));
                true
            }
            _ => false,
        }
    }

    /// Earliest instant at which [`poll`](Self::poll) has something to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.running {
            return None;
        }
        match (self.outstanding, self.next_ping) {
            (Some(probe), Some(tick)) => Some(probe.deadline.min(tick)),
            (Some(probe), None) => Some(probe.deadline),
            (None, tick) => tick,
        }
    }

    /// Advances the monitor to `now`.
    ///
    /// A missed pong is checked before a due tick; after `Dead` the monitor
    /// is stopped and reports `Idle` until restarted, so each missed reply
    /// yields exactly one `Dead`.
    pub fn poll(&mut self, now: Instant) -> HeartbeatAction {
        if !self.running {
            return HeartbeatAction::Idle;
        }

        if let Some(probe) = self.outstanding {
            if now >= probe.deadline {
                self.stop();
                return HeartbeatAction::Dead;
            }
        }

        let Some(tick) = self.next_ping else {
            return HeartbeatAction::Idle;
        };
        if now < tick {
            return HeartbeatAction::Idle;
        }

        // Keep the phase: skip every tick at or before `now`.
        let behind = now.saturating_duration_since(tick).as_nanos() / self.period.as_nanos();
        let skipped = u32::try_from(behind).unwrap_or(u32::MAX);
        self.next_ping = Some(tick + self.period * skipped.saturating_add(1));

        if self.outstanding.is_some() {
            return HeartbeatAction::Idle;
        }

        self.outstanding = Some(Probe {
            sent_at: now,
            deadline: now + self.timeout,
        });
        self.pings_sent += 1;
        HeartbeatAction::SendPing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn pings_on_fixed_phase() {
        let t0 = Instant::now();
        let mut hb = HeartbeatMonitor::new(ms(1000), ms(200));
        hb.start(t0);

        assert_eq!(hb.next_deadline(), Some(t0 + ms(1000)));
        assert_eq!(hb.poll(t0 + ms(999)), HeartbeatAction::Idle);
        assert_eq!(hb.poll(t0 + ms(1000)), HeartbeatAction::SendPing);
        assert_eq!(hb.next_deadline(), Some(t0 + ms(1200)));

        // Pong at 1150: the next ping stays at 2000, not 2150.
        assert!(hb.on_pong(t0 + ms(1150)));
        assert_eq!(hb.last_round_trip(), Some(ms(150)));
        assert_eq!(hb.next_deadline(), Some(t0 + ms(2000)));
        assert_eq!(hb.poll(t0 + ms(2000)), HeartbeatAction::SendPing);
        assert_eq!(hb.pings_sent(), 2);
    }

    #[test]
    fn missed_pong_is_reported_once() {
        let t0 = Instant::now();
        let mut hb = HeartbeatMonitor::new(ms(1000), ms(200));
        hb.start(t0);

        assert_eq!(hb.poll(t0 + ms(1000)), HeartbeatAction::SendPing);
        assert_eq!(hb.poll(t0 + ms(1199)), HeartbeatAction::Idle);
        assert_eq!(hb.poll(t0 + ms(1200)), HeartbeatAction::Dead);
        assert_eq!(hb.poll(t0 + ms(1300)), HeartbeatAction::Idle);
        assert!(!hb.is_running());
        assert_eq!(hb.next_deadline(), None);
    }

    #[test]
    fn overlapping_tick_is_skipped() {
        let t0 = Instant::now();
        // Pong timeout longer than the period.
        let mut hb = HeartbeatMonitor::new(ms(100), ms(250));
        hb.start(t0);

        assert_eq!(hb.poll(t0 + ms(100)), HeartbeatAction::SendPing);
        // Tick at 200 comes due while waiting: skipped.
        assert_eq!(hb.poll(t0 + ms(200)), HeartbeatAction::Idle);
        assert_eq!(hb.pings_sent(), 1);
        assert!(hb.on_pong(t0 + ms(220)));
        assert_eq!(hb.poll(t0 + ms(300)), HeartbeatAction::SendPing);
        assert_eq!(hb.poll(t0 + ms(550)), HeartbeatAction::Dead);
    }

    #[test]
    fn late_poll_keeps_phase() {
        let t0 = Instant::now();
        let mut hb = HeartbeatMonitor::new(ms(1000), ms(200));
        hb.start(t0);

        // Poll arrives late, after ticks 1000 and 2000.
        assert_eq!(hb.poll(t0 + ms(2500)), HeartbeatAction::SendPing);
        assert!(hb.on_pong(t0 + ms(2600)));
        assert_eq!(hb.next_deadline(), Some(t0 + ms(3000)));
    }

    #[test]
    fn stop_cancels_everything() {
        let t0 = Instant::now();
        let mut hb = HeartbeatMonitor::new(ms(1000), ms(200));
        hb.start(t0);
        assert_eq!(hb.poll(t0 + ms(1000)), HeartbeatAction::SendPing);

        hb.stop();
        assert_eq!(hb.next_deadline(), None);
        assert_eq!(hb.poll(t0 + ms(5000)), HeartbeatAction::Idle);
        assert!(!hb.on_pong(t0 + ms(5000)));
    }

    #[test]
    fn zero_period_disables() {
        let t0 = Instant::now();
        let mut hb = HeartbeatMonitor::new(Duration::ZERO, ms(200));
        hb.start(t0);
        assert!(!hb.is_running());
        assert_eq!(hb.poll(t0 + ms(10_000)), HeartbeatAction::Idle);
    }

    #[test]
    fn unsolicited_pong_is_ignored() {
        let t0 = Instant::now();
        let mut hb = HeartbeatMonitor::new(ms(1000), ms(200));
        hb.start(t0);
        assert!(!hb.on_pong(t0 + ms(10)));
    }
}
