//! Global request rate limiting shared by all workers of a benchmark.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Signals that a worker should stop issuing operations.
///
/// This is returned when the run was cancelled before or while waiting for request budget. It is
/// a regular termination signal, not a failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Stopped;

impl fmt::Display for Stopped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("run cancelled")
    }
}

impl std::error::Error for Stopped {}

/// Limits the rate at which all workers together issue operations.
///
/// Workers [`consult`](Self::consult) the limiter before every operation. While budget is
/// available, this returns immediately. Otherwise, the worker reserves the next free slot and
/// sleeps until it is due.
#[derive(Debug)]
pub struct RateLimiter {
    rps: f64,
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// Creates a limiter for `rps` operations per second.
    ///
    /// Up to `burst` operations may be issued at once after a period of inactivity. A burst of `0`
    /// admits a single operation at a time.
    pub fn new(rps: f64, burst: u32) -> Self {
        Self {
            rps,
            bucket: Mutex::new(TokenBucket::new(rps, burst)),
        }
    }

    /// The configured rate in operations per second.
    pub fn rps(&self) -> f64 {
        self.rps
    }

    /// Waits until the caller may issue its next operation.
    ///
    /// Returns [`Stopped`] if the token is cancelled before budget becomes available.
    pub async fn consult(&self, cancel: &CancellationToken) -> Result<(), Stopped> {
        if cancel.is_cancelled() {
            return Err(Stopped);
        }

        let delay = self.bucket.lock().unwrap().reserve(Instant::now());
        if delay.is_zero() {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Stopped),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// A token bucket that hands out reservations for future tokens.
///
/// Tokens refill at a constant rate up to capacity. Each reservation consumes one token; the
/// balance may go negative, in which case the reservation is due once it has been refilled.
///
/// This implementation is not thread-safe on its own. Wrap in a `Mutex` for concurrent access.
#[derive(Debug)]
struct TokenBucket {
    refill_rate: f64,
    capacity: f64,
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    /// Creates a new, full token bucket.
    ///
    /// - `rps`: tokens refilled per second (sustained rate limit)
    /// - `burst`: capacity of the bucket, at least one token
    fn new(rps: f64, burst: u32) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            refill_rate: rps,
            capacity,
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    /// Reserves a token and returns how long the caller has to wait for it.
    fn reserve(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_update = now;

        self.tokens -= 1.0;
        if self.tokens >= 0.0 || self.refill_rate <= 0.0 {
            return Duration::ZERO;
        }

        Duration::from_secs_f64(-self.tokens / self.refill_rate)
    }
}
