//! Time sources.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A monotonic time source.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// Wall-clock time from [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Time from the tokio runtime clock.
///
/// Follows `tokio::time::pause` and `advance`, which keeps the timer driver
/// and the multiplexer on the same timeline in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// A manually advanced clock for deterministic tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Creates a clock at offset zero.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Returns the instant at offset zero.
    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// Returns the instant `ms` milliseconds after the origin.
    pub fn at_ms(&self, ms: u64) -> Instant {
        self.origin + Duration::from_millis(ms)
    }

    /// Returns the current offset from the origin in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.offset.lock().as_millis()).unwrap_or(u64::MAX)
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Sets the clock to `ms` milliseconds after the origin.
    ///
    /// The clock never moves backwards; earlier values are ignored.
    pub fn set_ms(&self, ms: u64) {
        let target = Duration::from_millis(ms);
        let mut offset = self.offset.lock();
        if target > *offset {
            *offset = target;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), clock.origin());

        clock.advance(Duration::from_millis(150));
        assert_eq!(clock.elapsed_ms(), 150);

        clock.set_ms(400);
        assert_eq!(clock.now(), clock.at_ms(400));

        // Never goes backwards.
        clock.set_ms(100);
        assert_eq!(clock.elapsed_ms(), 400);
    }
}
