//! Per-connection token bucket with fixed-window refill.
//!
//! The bucket refills to full capacity at each window boundary rather than
//! trickling tokens continuously: a hard per-window cap with O(1)
//! bookkeeping per send. Bucket state lives on the connection record, so
//! admission is a plain field update under the connection's own lock.

use chrono::{DateTime, Duration, Utc};

/// Token bucket state for one connection.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    window: Duration,
    tokens: u32,
    resets_at: DateTime<Utc>,
}

impl TokenBucket {
    /// Creates a full bucket whose first window starts at `now`.
    #[must_use]
    pub fn new(capacity: u32, window_secs: u64, now: DateTime<Utc>) -> Self {
        let window = Duration::seconds(window_secs.min(i64::MAX as u64) as i64);
        Self {
            capacity,
            window,
            tokens: capacity,
            resets_at: now + window,
        }
    }

    /// Attempts to admit one send at `now`.
    ///
    /// Refills the bucket first if the window boundary has passed, then
    /// consumes one token if any remain.
    pub fn admit(&mut self, now: DateTime<Utc>) -> bool {
        if now >= self.resets_at {
            self.tokens = self.capacity;
            self.resets_at = now + self.window;
        }
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Seconds until the bucket refills, rounded up; at least 1.
    #[must_use]
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let remaining = self.resets_at - now;
        let secs = (remaining.num_milliseconds() + 999) / 1000;
        secs.max(1) as u64
    }

    /// Tokens remaining in the current window.
    #[must_use]
    pub const fn tokens(&self) -> u32 {
        self.tokens
    }

    /// Instant at which the bucket next refills.
    #[must_use]
    pub const fn resets_at(&self) -> DateTime<Utc> {
        self.resets_at
    }
}
