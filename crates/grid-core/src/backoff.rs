//! Jittered exponential backoff and the throttle-observation window.
//!
//! Throttled operations are retried in a bounded loop (never recursively) so
//! that cancellation stays observable and the stack stays flat. The sleep for
//! attempt `n` is drawn uniformly from `[base * 2^n, 2 * base * 2^n)`,
//! capped.

use rand::Rng;
use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Uniform jitter in `[value, 2 * value)`.
pub fn jitter(value: Duration) -> Duration {
    if value.is_zero() {
        return value;
    }
    let millis = (value.as_millis().min(u64::MAX as u128) as u64).clamp(1, 1 << 40);
    Duration::from_millis(rand::thread_rng().gen_range(millis..millis * 2))
}

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
            attempt: 0,
        }
    }

    /// The next delay to sleep before retrying, or `None` once the attempt
    /// budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        self.attempt += 1;
        Some(jitter(exp.min(self.cap)).min(self.cap.saturating_mul(2)))
    }

    pub fn attempts_used(&self) -> u32 {
        self.attempt
    }
}

/// Sliding window of observed write-throttle events.
///
/// The state-store wrappers record into this whenever a call comes back
/// `Throttled`; the reclaimer skips a whole cycle when the count over the
/// window exceeds its threshold, so it does not add load to a store already
/// under pressure.
#[derive(Debug)]
pub struct ThrottleWindow {
    window: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl ThrottleWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self) {
        let mut events = self.events.lock().expect("throttle window poisoned");
        events.push_back(Instant::now());
        Self::evict(&mut events, self.window);
    }

    /// Events observed within the window ending now.
    pub fn count(&self) -> usize {
        let mut events = self.events.lock().expect("throttle window poisoned");
        Self::evict(&mut events, self.window);
        events.len()
    }

    fn evict(events: &mut VecDeque<Instant>, window: Duration) {
        let now = Instant::now();
        while let Some(front) = events.front() {
            if now.duration_since(*front) > window {
                events.pop_front();
            } else {
                break;
            }
        }
    }
}
