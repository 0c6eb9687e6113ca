//! Pacing for periodic task loops

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crate::dispatcher::unix_seconds;

/// Longest uninterrupted sleep, bounding how late a stop request is noticed
const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// Monotonic run clock with the wall-clock time of its start.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    start: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Seconds since start, monotonic
    pub fn elapsed_s(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Current wall-clock time as unix seconds
    pub fn wall_timestamp(&self) -> f64 {
        unix_seconds(SystemTime::now())
    }
}

/// Fixed-period loop pacing: each tick sleeps for whatever is left of the period
/// after the work is done, and not at all if the work overran.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    period: Duration,
    tick_start: Instant,
}

impl Pacer {
    pub fn new(period_s: f64) -> Self {
        Self {
            period: Duration::try_from_secs_f64(period_s).unwrap_or(Duration::ZERO),
            tick_start: Instant::now(),
        }
    }

    /// Mark the start of a tick
    pub fn begin(&mut self) {
        self.tick_start = Instant::now();
    }

    /// Time left in the current tick
    pub fn remaining(&self) -> Duration {
        self.period.saturating_sub(self.tick_start.elapsed())
    }

    /// Sleep out the rest of the tick. Returns false if a stop was requested meanwhile.
    pub fn wait(&self, stop: &AtomicBool) -> bool {
        sleep_unless_stopped(self.remaining(), stop)
    }
}

/// Sleep in short slices, returning early (and false) if `stop` is raised.
pub fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return true;
        }
        thread::sleep(left.min(SLEEP_SLICE));
    }
}
