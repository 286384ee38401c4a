//! Monotonic time and delays used by the bus timing.

use std::fmt::Debug;
use std::hint::spin_loop;
use std::thread;
use std::time::{Duration, Instant};

/// Monotonic clock with the delay primitives the HD44780 timing needs.
///
/// `now` is measured from an arbitrary, fixed origin. Only differences between two readings are
/// meaningful.
pub trait Clock: Debug + Send + Sync {
    /// Current monotonic time.
    fn now(&self) -> Duration;

    /// Blocks the calling thread for at least `duration`.
    fn sleep(&self, duration: Duration);

    /// Gives up the rest of the time slice without a minimum delay.
    fn yield_now(&self);

    fn sleep_ns(&self, ns: u64) {
        self.sleep(Duration::from_nanos(ns));
    }

    fn sleep_us(&self, us: u64) {
        self.sleep(Duration::from_micros(us));
    }

    fn sleep_ms(&self, ms: u64) {
        self.sleep(Duration::from_millis(ms));
    }
}

/// [Clock] backed by [Instant] and the OS scheduler.
///
/// Delays shorter than [SystemClock::SPIN_THRESHOLD] are busy-waited, since the scheduler cannot
/// honour sub-millisecond sleeps and pulse holds must not stretch into milliseconds.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub const SPIN_THRESHOLD: Duration = Duration::from_millis(1);

    pub fn new() -> Self {
        SystemClock { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        if duration >= Self::SPIN_THRESHOLD {
            thread::sleep(duration);
            return;
        }

        let start = Instant::now();
        while start.elapsed() < duration {
            spin_loop();
        }
    }

    fn yield_now(&self) {
        thread::yield_now();
    }
}
