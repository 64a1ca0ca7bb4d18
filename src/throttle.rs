//! Token-bucket rate limiting of worker request throughput.
//!
//! When a per-worker requests-per-second cap is configured, every virtual user
//! acquires a token before each HTTP call. Tokens replenish at `rate` per
//! second and the bucket holds at most `burst` tokens, so short bursts are
//! admitted but the sustained rate over any window is bounded by
//! `burst + rate * window`.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Internal bucket state, guarded by [`Throttle`]'s lock.
#[derive(Debug)]
struct TokenBucket {
    /// Tokens added per second.
    rate: f64,
    /// Maximum token count.
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }
}

/// An async token-bucket rate limiter shared by all virtual users of a worker.
///
/// At most one virtual user holds the lock at a time, and the lock is released
/// while waiting for a refill so other users can proceed.
#[derive(Debug)]
pub struct Throttle {
    rate: f64,
    bucket: Mutex<TokenBucket>,
}

impl Throttle {
    /// Build a throttle admitting `rate` requests per second with bursts of up
    /// to `burst` tokens. A rate of 0 disables the throttle entirely.
    pub fn new(rate: f64, burst: f64) -> Throttle {
        let burst = if burst > 0.0 { burst } else { rate };
        Throttle {
            rate,
            bucket: Mutex::new(TokenBucket {
                rate,
                burst,
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.rate <= 0.0
    }

    /// Acquire a single token, suspending until one is available.
    pub async fn acquire(&self) {
        if self.is_disabled() {
            return;
        }
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                bucket.refill();
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                (1.0 - bucket.tokens) / bucket.rate
            };
            // Lock released while sleeping; retry after the refill interval.
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_always_admits() {
        let throttle = Throttle::new(0.0, 0.0);
        assert!(throttle.is_disabled());
        for _ in 0..10_000 {
            throttle.acquire().await;
        }
    }

    #[tokio::test]
    async fn burst_admitted_immediately() {
        let throttle = Throttle::new(10.0, 5.0);
        let started = Instant::now();
        for _ in 0..5 {
            throttle.acquire().await;
        }
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn sustained_rate_is_bounded() {
        // 100 tokens/sec with a burst of 5: 25 acquires need ~200ms of refill.
        let throttle = Throttle::new(100.0, 5.0);
        let started = Instant::now();
        for _ in 0..25 {
            throttle.acquire().await;
        }
        let window = started.elapsed().as_secs_f64();
        assert!(window >= 0.15, "admitted too fast: {}s", window);
        // Admitted count never exceeds burst + rate * window.
        assert!(25.0 <= 5.0 + 100.0 * window + 1.0);
    }

    #[tokio::test]
    async fn default_burst_is_one_second_of_rate() {
        let throttle = Throttle::new(50.0, 0.0);
        let started = Instant::now();
        // A full second of burst should admit instantly.
        for _ in 0..50 {
            throttle.acquire().await;
        }
        assert!(started.elapsed() < Duration::from_millis(100));
    }
}
