//! Token bucket limiting requests per minute to a metered API.
//!
//! The public VirusTotal tier allows 4 lookups per minute; the bucket starts
//! full so a burst of that size goes out at once, then refills continuously.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct RequestRateLimiter {
    inner: Arc<Mutex<BucketState>>,
}

#[derive(Debug)]
struct BucketState {
    available: f64,
    capacity: f64,
    /// Tokens per second
    refill_rate: f64,
    last_refill: Instant,
    total_requests: u64,
}

impl BucketState {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.available = (self.available + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }
}

impl RequestRateLimiter {
    pub fn per_minute(requests: u32) -> Self {
        let capacity = requests.max(1) as f64;
        Self::with_rate(capacity / 60.0, capacity)
    }

    pub fn with_rate(refill_rate: f64, capacity: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BucketState {
                available: capacity,
                capacity,
                refill_rate,
                last_refill: Instant::now(),
                total_requests: 0,
            })),
        }
    }

    /// Wait until one request may be sent
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.inner.lock().await;
                state.refill();
                trace!("Rate limiter: {:.2}/{:.0} tokens", state.available, state.capacity);

                if state.available >= 1.0 {
                    state.available -= 1.0;
                    state.total_requests += 1;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.available) / state.refill_rate)
            };

            debug!("Rate limit reached, waiting {:.2}s", wait.as_secs_f64());
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token only if one is available now
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.inner.lock().await;
        state.refill();
        if state.available >= 1.0 {
            state.available -= 1.0;
            state.total_requests += 1;
            true
        } else {
            false
        }
    }

    pub async fn total_requests(&self) -> u64 {
        self.inner.lock().await.total_requests
    }
}
