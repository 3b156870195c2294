//! Connection timing policy.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing thresholds for a sync connection.
///
/// All values are millisecond-precision durations. A connection copies the
/// policy when it starts connecting, so changing the manager's policy later
/// only affects connections opened afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingPolicy {
    /// Maximum time for a connection to become fully established, covering
    /// address resolution, transport connect, TLS and the sync handshake.
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// How long a connection stays open after its last session leaves.
    #[serde(rename = "connection_linger_time_ms", with = "millis")]
    pub connection_linger_time: Duration,
    /// Time between PING messages. Zero disables the heartbeat.
    #[serde(rename = "ping_keepalive_period_ms", with = "millis")]
    pub ping_keepalive_period: Duration,
    /// Time to wait for a PONG before the connection is declared dead.
    #[serde(rename = "pong_keepalive_timeout_ms", with = "millis")]
    pub pong_keepalive_timeout: Duration,
    /// Maximum time since the previous disconnect for a new connection to
    /// count as a fast reconnect.
    #[serde(rename = "fast_reconnect_limit_ms", with = "millis")]
    pub fast_reconnect_limit: Duration,
}

impl Default for TimingPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(120_000),
            connection_linger_time: Duration::from_millis(30_000),
            ping_keepalive_period: Duration::from_millis(60_000),
            pong_keepalive_timeout: Duration::from_millis(120_000),
            fast_reconnect_limit: Duration::from_millis(60_000),
        }
    }
}

impl TimingPolicy {
    /// Creates a policy with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the connection linger time.
    #[must_use]
    pub const fn with_connection_linger_time(mut self, linger: Duration) -> Self {
        self.connection_linger_time = linger;
        self
    }

    /// Sets the ping keepalive period.
    #[must_use]
    pub const fn with_ping_keepalive_period(mut self, period: Duration) -> Self {
        self.ping_keepalive_period = period;
        self
    }

    /// Sets the pong keepalive timeout.
    #[must_use]
    pub const fn with_pong_keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.pong_keepalive_timeout = timeout;
        self
    }

    /// Sets the fast reconnect limit.
    #[must_use]
    pub const fn with_fast_reconnect_limit(mut self, limit: Duration) -> Self {
        self.fast_reconnect_limit = limit;
        self
    }

    /// Returns true if the heartbeat is enabled.
    pub fn heartbeat_enabled(&self) -> bool {
        !self.ping_keepalive_period.is_zero()
    }

    /// Checks the policy for combinations that work but are probably
    /// unintended.
    ///
    /// None of these are errors: the connection honours every combination.
    pub fn validate(&self) -> Vec<TimingWarning> {
        let mut warnings = Vec::new();

        if self.heartbeat_enabled() && self.pong_keepalive_timeout >= self.ping_keepalive_period {
            warnings.push(TimingWarning::OverlappingProbes {
                ping_period: self.ping_keepalive_period,
                pong_timeout: self.pong_keepalive_timeout,
            });
        }
        if !self.heartbeat_enabled() {
            warnings.push(TimingWarning::HeartbeatDisabled);
        }
        if self.connect_timeout.is_zero() {
            warnings.push(TimingWarning::ZeroConnectTimeout);
        }

        warnings
    }
}

/// A suspicious but legal timing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingWarning {
    /// The pong timeout is not shorter than the ping period, so a ping tick
    /// can come due while the previous probe is still outstanding. Such
    /// ticks are skipped.
    OverlappingProbes {
        /// Configured ping period.
        ping_period: Duration,
        /// Configured pong timeout.
        pong_timeout: Duration,
    },
    /// The ping period is zero; dead connections are only detected by the
    /// transport.
    HeartbeatDisabled,
    /// Every connect attempt times out on the first timer poll.
    ZeroConnectTimeout,
}

impl fmt::Display for TimingWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimingWarning::OverlappingProbes {
                ping_period,
                pong_timeout,
            } => write!(
                f,
                "pong timeout ({} ms) is not smaller than ping period ({} ms); overlapping pings will be skipped",
                pong_timeout.as_millis(),
                ping_period.as_millis()
            ),
            TimingWarning::HeartbeatDisabled => write!(f, "ping period is zero; heartbeat disabled"),
            TimingWarning::ZeroConnectTimeout => {
                write!(f, "connect timeout is zero; every attempt will time out")
            }
        }
    }
}

/// Serde helper encoding a `Duration` as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
