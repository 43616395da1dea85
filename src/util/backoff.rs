//! Escalating backoff and deadlines for host-side polling loops.

use std::hint::spin_loop;
use std::thread;
use std::time::{Duration, Instant};

/// Spin, then yield, then sleep with a growing (capped) interval.
///
/// Used wherever the host polls a word another process writes: event
/// host-waits and pipe/socket readiness retries.
#[derive(Debug)]
pub struct Backoff {
    step: u32,
    max_sleep: Duration,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 10;

    /// Create a new backoff instance
    pub fn new() -> Self {
        Self::with_max_sleep(Duration::from_micros(500))
    }

    /// Create a backoff whose sleep phase never exceeds `max_sleep`
    pub fn with_max_sleep(max_sleep: Duration) -> Self {
        Self { step: 0, max_sleep }
    }

    /// Reset the backoff to its initial state
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Perform one step of backoff
    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                spin_loop();
            }
        } else if self.step <= Self::YIELD_LIMIT {
            thread::yield_now();
        } else {
            let exp = (self.step - Self::YIELD_LIMIT).min(16);
            let sleep = Duration::from_micros(1u64 << exp).min(self.max_sleep);
            thread::sleep(sleep);
        }
        self.step = self.step.saturating_add(1);
    }

    /// Check if we've reached the sleep phase
    pub fn is_completed(&self) -> bool {
        self.step > Self::YIELD_LIMIT
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// A point in time a blocking cross-process wait must not outlive.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    timeout: Duration,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            start: Instant::now(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn expired(&self) -> bool {
        self.elapsed() >= self.timeout
    }

    /// Time left, saturating at zero.
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.elapsed())
    }

    /// Remaining time as a `poll(2)` timeout in milliseconds, rounded up so a
    /// sub-millisecond remainder still blocks once.
    pub fn poll_millis(&self) -> libc::c_int {
        let remaining = self.remaining();
        let mut millis = remaining.as_millis();
        if remaining.subsec_nanos() % 1_000_000 != 0 {
            millis += 1;
        }
        millis.min(libc::c_int::MAX as u128) as libc::c_int
    }
}
