//! Bandwidth throttling hooks for the reactor.
//!
//! The reactor asks its [`Throttle`] how many bytes it may move before every
//! socket read or write. A grant of zero defers the operation; the reactor
//! retries deferred reads and writes on each sweep, so a throttled connection
//! stalls without being dropped.
//!
//! # Example
//!
//! ```
//! use bitswarm::throttle::{BandwidthLimiter, Direction, Throttle};
//!
//! // 1MB/s download, 500KB/s upload; 0 means unlimited.
//! let limiter = BandwidthLimiter::new(1_000_000, 500_000);
//! let granted = limiter.admit(Direction::Download, 16384);
//! assert!(granted <= 16384);
//! ```

use std::time::Instant;

use parking_lot::Mutex;

/// Which way bytes are flowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

/// Decides how many bytes a socket operation may transfer.
pub trait Throttle: Send + Sync {
    /// Grants up to `wanted` bytes and consumes the grant.
    fn admit(&self, direction: Direction, wanted: usize) -> usize;

    /// Returns bytes that were granted but not transferred.
    fn refund(&self, _direction: Direction, _unused: usize) {}
}

/// A throttle that grants every request in full.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unthrottled;

impl Throttle for Unthrottled {
    fn admit(&self, _direction: Direction, wanted: usize) -> usize {
        wanted
    }
}

/// A token bucket rate limiter.
///
/// Tokens accrue at a fixed rate up to twice the per-second rate, allowing
/// short bursts.
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    tokens_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        self.tokens = (self.tokens + elapsed * self.tokens_per_sec).min(self.max_tokens);
    }
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        let max_tokens = (bytes_per_sec * 2) as f64;
        Self {
            bucket: Mutex::new(TokenBucket {
                tokens: max_tokens,
                max_tokens,
                tokens_per_sec: bytes_per_sec as f64,
                last_update: Instant::now(),
            }),
        }
    }

    /// Updates the rate limit, keeping at most the new burst size.
    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        bucket.tokens_per_sec = bytes_per_sec as f64;
        bucket.max_tokens = (bytes_per_sec * 2) as f64;
        bucket.tokens = bucket.tokens.min(bucket.max_tokens);
    }

    /// Takes up to `wanted` whole tokens from the bucket.
    pub fn take(&self, wanted: usize) -> usize {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        let granted = (bucket.tokens.floor() as usize).min(wanted);
        bucket.tokens -= granted as f64;
        granted
    }

    pub fn give_back(&self, unused: usize) {
        let mut bucket = self.bucket.lock();
        bucket.tokens = (bucket.tokens + unused as f64).min(bucket.max_tokens);
    }

    /// Returns the currently available tokens (bytes).
    pub fn available(&self) -> usize {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        bucket.tokens as usize
    }
}

/// Separate download and upload limits. A missing limiter means unlimited.
#[derive(Default)]
pub struct BandwidthLimiter {
    download: Option<RateLimiter>,
    upload: Option<RateLimiter>,
}

impl BandwidthLimiter {
    /// Creates a limiter; a limit of 0 means unlimited.
    pub fn new(download_limit: u64, upload_limit: u64) -> Self {
        Self {
            download: (download_limit > 0).then(|| RateLimiter::new(download_limit)),
            upload: (upload_limit > 0).then(|| RateLimiter::new(upload_limit)),
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    fn limiter(&self, direction: Direction) -> Option<&RateLimiter> {
        match direction {
            Direction::Download => self.download.as_ref(),
            Direction::Upload => self.upload.as_ref(),
        }
    }
}

impl Throttle for BandwidthLimiter {
    fn admit(&self, direction: Direction, wanted: usize) -> usize {
        match self.limiter(direction) {
            Some(limiter) => limiter.take(wanted),
            None => wanted,
        }
    }

    fn refund(&self, direction: Direction, unused: usize) {
        if let Some(limiter) = self.limiter(direction) {
            limiter.give_back(unused);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unthrottled_grants_everything() {
        assert_eq!(Unthrottled.admit(Direction::Upload, 1 << 20), 1 << 20);
    }

    #[test]
    fn test_bucket_allows_burst_then_limits() {
        let limiter = RateLimiter::new(1000);
        assert_eq!(limiter.take(1500), 1500);
        let rest = limiter.take(1500);
        assert!(rest >= 500 && rest < 600, "got {rest}");
        assert!(limiter.take(1000) < 100);
    }

    #[test]
    fn test_refund_restores_tokens() {
        let limiter = BandwidthLimiter::new(0, 100);
        assert_eq!(limiter.admit(Direction::Upload, 200), 200);
        limiter.refund(Direction::Upload, 150);
        assert!(limiter.admit(Direction::Upload, 200) >= 150);
        assert_eq!(limiter.admit(Direction::Download, 1 << 20), 1 << 20);
    }

    #[test]
    fn test_set_rate_caps_tokens() {
        let limiter = RateLimiter::new(10_000);
        limiter.set_rate(10);
        assert!(limiter.available() <= 20);
    }
}
