use std::sync::Mutex;
use std::time::Instant;

use zen_core::config::RateLimitConfig;

pub const DEFAULT_BURST: u32 = 20;
pub const DEFAULT_RATE: f64 = 10.0;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Continuous-refill token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    bucket: Mutex<Bucket>,
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(DEFAULT_BURST, DEFAULT_RATE)
    }
}

impl TokenBucket {
    /// Starts full.
    pub fn new(burst: u32, rate_per_sec: f64) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            rate: if rate_per_sec > 0.0 { rate_per_sec } else { DEFAULT_RATE },
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        Self::new(cfg.burst, cfg.rate_per_sec)
    }

    fn refill(&self, b: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(b.last_refill).as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.rate).min(self.capacity);
        b.last_refill = now;
    }

    /// Take one token if one is available.
    pub fn allow(&self) -> bool {
        let mut b = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut b);
        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take one token only when more than half the bucket is left, so
    /// background probes never starve real calls.
    pub fn allow_spare(&self) -> bool {
        let mut b = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut b);
        if b.tokens - 1.0 >= self.capacity / 2.0 {
            b.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available(&self) -> f64 {
        let mut b = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut b);
        b.tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }
}
