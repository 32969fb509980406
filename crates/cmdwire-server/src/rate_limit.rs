//! Token-bucket limiter for inbound frames.
//!
//! Each session's read loop owns one limiter, so there is no locking.
//! The bucket starts full and refills continuously at `messages_per_second`
//! up to `burst` tokens.

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub messages_per_second: f64,
    pub burst: u32,
    pub enabled: bool,
}

impl RateLimitConfig {
    pub fn new(messages_per_second: f64, burst: u32) -> Self {
        Self {
            messages_per_second,
            burst,
            enabled: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(100.0, 200)
    }
}

#[derive(Debug)]
struct Bucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<Bucket>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            return Self::unlimited();
        }
        let capacity = f64::from(config.burst);
        Self {
            bucket: Some(Bucket {
                rate: config.messages_per_second.max(0.0),
                capacity,
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// A limiter that admits everything.
    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Take one token as of `now`. Never blocks.
    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        let Some(bucket) = self.bucket.as_mut() else {
            return true;
        };

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * bucket.rate).min(bucket.capacity);
        if now > bucket.last_refill {
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
