//! Token-bucket bandwidth limiter
//!
//! One limiter per bridge, shared by both copy directions. Rate is the
//! mapping's `bandwidth_limit` in bytes per second; burst is twice the
//! rate. The bucket may run a debt: a caller asking for more tokens
//! than are available is charged immediately and sleeps off the
//! deficit, which keeps a single 32 KiB read ahead of a tiny
//! configured rate from deadlocking.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

/// Byte-rate limiter
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Limiter for `bytes_per_sec`, with burst `2 * bytes_per_sec`.
    /// Returns `None` when the rate is zero (unlimited).
    pub fn from_bandwidth_limit(bytes_per_sec: u64) -> Option<Self> {
        if bytes_per_sec == 0 {
            return None;
        }
        let rate = bytes_per_sec as f64;
        Some(Self {
            rate,
            burst: rate * 2.0,
            state: Mutex::new(BucketState {
                tokens: rate * 2.0,
                refilled_at: Instant::now(),
            }),
        })
    }

    /// Take `n` tokens, sleeping until the bucket covers them
    pub async fn wait_n(&self, n: usize) {
        let deficit = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
            state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
            state.refilled_at = now;
            state.tokens -= n as f64;
            -state.tokens
        };

        if deficit > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(deficit / self.rate)).await;
        }
    }
}
