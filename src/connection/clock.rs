use std::{
    cell::Cell,
    thread::sleep,
    time::{Duration, Instant},
};

/// Source of time for timed waits
pub trait Clock {
    /// Time elapsed since an arbitrary fixed origin, never decreasing
    fn now(&self) -> Duration;

    /// Block for `period`
    fn sleep(&self, period: Duration);
}

/// Wall clock backed by [Instant]
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, period: Duration) {
        sleep(period);
    }
}

/// Clock that only moves when told to
///
/// Sleeping advances it instantly, which keeps timed waits deterministic.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<Duration>,
}

impl ManualClock {
    pub fn new(start: Duration) -> Self {
        ManualClock {
            now: Cell::new(start),
        }
    }

    pub fn advance(&self, period: Duration) {
        self.now.set(self.now.get() + period);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }

    fn sleep(&self, period: Duration) {
        self.advance(period);
    }
}
