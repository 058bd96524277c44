//! Transfer rate limiting shared by every backend.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Burst capacity, in seconds worth of the configured rate.
const BURST_SECONDS: f64 = 3.0;
/// Bytes per second in one megabit per second.
const BYTES_PER_MBPS: f64 = (1u64 << 20) as f64 / 8.0;

/// Process-wide token bucket bounding transfer throughput in bytes.
///
/// Constructed once from a megabits-per-second budget and shared by
/// reference among all storage instances. A budget of zero disables
/// limiting entirely.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<Mutex<Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    /// Refill rate in bytes per second.
    rate: f64,
    capacity: f64,
    /// Available tokens. Negative while waiters are repaying a reservation.
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take `bytes` tokens and return how long the caller must wait until
    /// they are paid for.
    fn reserve(&mut self, bytes: u64, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= bytes as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}

impl RateLimiter {
    /// Create a limiter allowing `mbps` megabits per second.
    ///
    /// The bucket starts full with a burst of three seconds worth of bytes.
    pub fn new(mbps: u64) -> Self {
        if mbps == 0 {
            return Self::unlimited();
        }

        // Float math, so huge budgets cannot overflow.
        let rate = mbps as f64 * BYTES_PER_MBPS;
        let capacity = rate * BURST_SECONDS;
        Self {
            bucket: Some(Mutex::new(Bucket {
                rate,
                capacity,
                tokens: capacity,
                last_refill: Instant::now(),
            })),
        }
    }

    /// A limiter that never delays.
    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    /// Whether limiting is enabled.
    pub fn is_set(&self) -> bool {
        self.bucket.is_some()
    }

    /// Configured rate in bytes per second, if limiting is enabled.
    pub fn bytes_per_second(&self) -> Option<u64> {
        self.bucket
            .as_ref()
            .map(|bucket| bucket.lock().unwrap_or_else(|e| e.into_inner()).rate as u64)
    }

    /// Block the calling task until `bytes` may be transferred.
    pub async fn wait(&self, bytes: u64) {
        let Some(bucket) = &self.bucket else {
            return;
        };

        let delay = bucket
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reserve(bytes, Instant::now());

        if !delay.is_zero() {
            debug!("Rate limited: waiting {:?} for {} bytes", delay, bytes);
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}
