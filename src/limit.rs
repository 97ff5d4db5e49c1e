use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

/// Global bytes-per-second budget shared by all range workers.
pub struct Throttle {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    burst: NonZeroU32,
}

impl Throttle {
    pub fn per_second(bytes: NonZeroU32) -> Self {
        Self {
            limiter: RateLimiter::direct(Quota::per_second(bytes)),
            burst: bytes,
        }
    }

    /// Waits until `len` bytes fit in the budget. Chunks larger than one second's worth
    /// are admitted in burst-sized pieces.
    pub async fn acquire(&self, len: usize) {
        let mut left = u64::try_from(len).unwrap_or(u64::MAX);
        while left > 0 {
            let take = left.min(u64::from(self.burst.get())) as u32;
            if let Some(n) = NonZeroU32::new(take) {
                // `take` never exceeds the burst, so capacity is always sufficient.
                let _ = self.limiter.until_n_ready(n).await;
            }
            left -= u64::from(take);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn chunks_larger_than_burst_are_admitted() {
        let throttle = Throttle::per_second(NonZeroU32::new(1000).unwrap());
        let started = Instant::now();
        throttle.acquire(1000).await;
        throttle.acquire(500).await;
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn empty_chunks_do_not_wait() {
        let throttle = Throttle::per_second(NonZeroU32::new(1).unwrap());
        let started = Instant::now();
        throttle.acquire(0).await;
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
