//! Token bucket rate control and the run clock.

use std::time::Duration;
use tbload_core::EpochMillis;
use tokio::time::Instant;

/// Guards against float accumulation leaving a token at 0.999..
const TOKEN_EPSILON: f64 = 1e-9;

/// Token bucket refilled continuously at `rate` tokens per second.
///
/// Owned by a single scheduler task; every method takes `now` explicitly so the
/// caller decides which instant a tick represents.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// An empty bucket; tokens accrue from `now`.
    pub fn new(rate: f64, capacity: f64, now: Instant) -> Self {
        Self {
            rate: rate.max(0.0),
            capacity: capacity.max(1.0),
            tokens: 0.0,
            last: now,
        }
    }

    /// Capacity holds `window` worth of tokens, and at least one.
    pub fn with_burst_window(rate: f64, window: Duration, now: Instant) -> Self {
        Self::new(rate, rate * window.as_secs_f64(), now)
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Accrue tokens for the time elapsed since the last refill. Returns
    /// the (possibly fractional) tokens lost to the capacity limit.
    pub fn refill(&mut self, now: Instant) -> f64 {
        if now <= self.last {
            return 0.0;
        }
        let elapsed = now.duration_since(self.last).as_secs_f64();
        let accrued = self.tokens + elapsed * self.rate;
        self.tokens = accrued.min(self.capacity);
        self.last = now;
        accrued - self.tokens
    }

    /// Whole tokens currently available
    pub fn available(&self) -> u64 {
        (self.tokens + TOKEN_EPSILON).floor() as u64
    }

    pub fn try_take(&mut self) -> bool {
        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }

    /// Take up to `max` whole tokens, returning how many were taken.
    pub fn take_up_to(&mut self, max: u64) -> u64 {
        let n = self.available().min(max);
        self.tokens = (self.tokens - n as f64).max(0.0);
        n
    }
}

/// Wall-clock timestamps that advance with the tokio clock.
///
/// Anchored to the wall clock once at run start, then driven by
/// `tokio::time::Instant`, so timestamps never go backwards and follow a paused
/// test clock.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    wall_start_ms: EpochMillis,
    start: Instant,
}

impl RunClock {
    pub fn start() -> Self {
        Self {
            wall_start_ms: chrono::Utc::now().timestamp_millis(),
            start: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> EpochMillis {
        self.at_ms(Instant::now())
    }

    pub fn at_ms(&self, at: Instant) -> EpochMillis {
        self.wall_start_ms + at.saturating_duration_since(self.start).as_millis() as EpochMillis
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
