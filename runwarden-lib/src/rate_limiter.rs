//! Token bucket rate limiter with sub-second granularity.
//!
//! Admits at most `burst` immediate operations and refills one token per
//! configured interval. The indicator pipeline uses it to decide whether an
//! incoming indicator may trigger an immediate flush or has to wait for the
//! periodic tick.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Rate limit configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Maximum number of tokens (burst capacity)
    pub capacity: usize,
    /// Number of tokens added per second
    pub refill_rate: f64,
}

impl RateLimitConfig {
    pub fn new(capacity: usize, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
        }
    }

    /// One token every `interval`, holding at most `burst`.
    pub fn every(interval: Duration, burst: usize) -> Self {
        let secs = interval.as_secs_f64();
        let refill_rate = if secs > 0.0 { 1.0 / secs } else { f64::INFINITY };
        Self::new(burst, refill_rate)
    }
}

/// Token bucket state.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            tokens: config.capacity as f64,
            capacity: config.capacity as f64,
            refill_rate: config.refill_rate,
            last_update: Instant::now(),
        }
    }

    fn try_consume(&mut self, tokens: usize) -> bool {
        if self.refill_rate.is_infinite() {
            return true;
        }
        self.refill();
        let tokens_needed = tokens as f64;
        if self.tokens >= tokens_needed {
            self.tokens -= tokens_needed;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update);
        self.last_update = now;

        let tokens_to_add = self.refill_rate * elapsed.as_secs_f64();
        self.tokens = (self.tokens + tokens_to_add).min(self.capacity);
    }

    #[cfg(test)]
    fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// Single-bucket rate limiter.
///
/// The bucket lock is never held across an await, so a std mutex is enough.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(config)),
        }
    }

    /// Consume one token. Returns `false` when rate limited.
    pub fn allow(&self) -> bool {
        let mut bucket = self.bucket.lock().unwrap_or_else(|p| p.into_inner());
        let allowed = bucket.try_consume(1);
        if !allowed {
            debug!("rate limit exceeded");
        }
        allowed
    }
}
