use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::time::Duration;

use parking_lot::Mutex;
use quanta::Clock;
use quanta::Instant;

use super::Reason;
use super::Strategy;

/// Capacity and refill rate of a token bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    pub capacity: NonZeroUsize,
    pub refill_per_second: f64,
}

impl BucketConfig {
    pub fn new(capacity: NonZeroUsize, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
        }
    }

    fn rate(&self) -> f64 {
        if self.refill_per_second.is_finite() && self.refill_per_second > 0.0 {
            self.refill_per_second
        } else {
            0.0
        }
    }
}

/// Unsynchronised bucket accounting.
///
/// Callers provide the synchronisation: [`TokenBucket`] wraps one in its own
/// mutex, while registry entries are guarded by the registry lock.
#[derive(Debug, Clone)]
pub struct BucketState {
    capacity: f64,
    rate: f64,
    available: f64,
    last_refill: Instant,
}

impl BucketState {
    /// A full bucket, last refilled at `now`.
    pub fn new(config: BucketConfig, now: Instant) -> Self {
        let capacity = config.capacity.get() as f64;
        Self {
            capacity,
            rate: config.rate(),
            available: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        // `now` may trail `last_refill` when readers race on the clock
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        self.available = (self.available + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Tokens available at `now`, after lazy refill.
    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.available
    }

    /// Take one token if at least one is available at `now`.
    pub fn try_consume(&mut self, now: Instant) -> ControlFlow<Reason> {
        self.refill(now);
        if self.available >= 1.0 {
            self.available -= 1.0;
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(Reason::Overloaded {
                retry_after: self.retry_after(),
            })
        }
    }

    fn retry_after(&self) -> Duration {
        if self.rate == 0.0 {
            return Duration::MAX;
        }
        let missing = 1.0 - self.available;
        Duration::try_from_secs_f64(missing / self.rate).unwrap_or(Duration::MAX)
    }
}

/// A thread-safe token bucket.
///
/// Starts full. Refill is computed lazily on every consult as
/// `min(capacity, available + elapsed * rate)`, so no timer is needed.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    clock: Clock,
}

impl Strategy for TokenBucket {
    fn process(&self) -> ControlFlow<Reason> {
        let now = self.clock.now();
        self.state.lock().try_consume(now)
    }
}

impl TokenBucket {
    /// Creates a new `TokenBucket`.
    ///
    /// # Arguments
    ///
    /// * `capacity` - The maximum number of tokens (the burst size).
    /// * `refill_per_second` - Tokens added per second. Zero, negative or
    ///   non-finite rates never refill.
    pub fn new(capacity: NonZeroUsize, refill_per_second: f64) -> Self {
        Self::with_clock(BucketConfig::new(capacity, refill_per_second), Clock::new())
    }

    pub fn with_clock(config: BucketConfig, clock: Clock) -> Self {
        let now = clock.now();
        Self {
            state: Mutex::new(BucketState::new(config, now)),
            clock,
        }
    }

    /// Currently available tokens, without consuming any.
    pub fn available(&self) -> f64 {
        let now = self.clock.now();
        self.state.lock().available(now)
    }
}
