use std::time::Duration;
use tokio::time::{sleep, Instant};

const MICROS_PER_SECOND: u128 = 1_000_000;

/// Token bucket with integer-only math, pacing iteration starts for the
/// arrival-rate executors.
pub struct RateLimiter {
    /// Tokens per second.
    rate: u64,
    /// Maximum tokens that can accumulate.
    capacity: u64,
    /// Current tokens, scaled by `MICROS_PER_SECOND`.
    tokens: u128,
    last_refill: Instant,
}

impl RateLimiter {
    /// Starts with a single token so a run does not open with a burst.
    pub fn new(rate: u64) -> Self {
        Self::with_capacity(rate, rate.max(1))
    }

    pub fn with_capacity(rate: u64, capacity: u64) -> Self {
        Self {
            rate,
            capacity,
            tokens: MICROS_PER_SECOND.min(capacity as u128 * MICROS_PER_SECOND),
            last_refill: Instant::now(),
        }
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Changes the rate, e.g. at a stage boundary.
    pub fn set_rate(&mut self, rate: u64) {
        if rate == self.rate {
            return;
        }
        self.refill();
        self.rate = rate;
        self.capacity = rate.max(1);
        self.tokens = self.tokens.min(self.capacity as u128 * MICROS_PER_SECOND);
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed_micros = now.duration_since(self.last_refill).as_micros();
        if elapsed_micros == 0 {
            return;
        }

        // rate * elapsed_micros is already in micro-token scale.
        let added = (self.rate as u128) * elapsed_micros;
        let max_tokens = (self.capacity as u128) * MICROS_PER_SECOND;
        self.tokens = self.tokens.saturating_add(added).min(max_tokens);
        self.last_refill = now;
    }

    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= MICROS_PER_SECOND {
            self.tokens -= MICROS_PER_SECOND;
            true
        } else {
            false
        }
    }

    /// Waits for a token. Returns `false` without waiting when the rate is
    /// zero, leaving it to the caller to re-check its stage.
    pub async fn acquire(&mut self) -> bool {
        loop {
            if self.try_acquire() {
                return true;
            }
            if self.rate == 0 {
                return false;
            }

            let deficit = MICROS_PER_SECOND.saturating_sub(self.tokens);
            let wait_micros = (deficit / self.rate as u128).max(1);
            sleep(Duration::from_micros(wait_micros as u64)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_token_is_immediate() {
        let mut limiter = RateLimiter::new(100);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_matches_rate() {
        let mut limiter = RateLimiter::new(1000);
        assert!(limiter.try_acquire());

        tokio::time::advance(Duration::from_millis(100)).await;

        let mut acquired = 0;
        while limiter.try_acquire() {
            acquired += 1;
        }
        assert_eq!(acquired, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_paces_iterations() {
        let mut limiter = RateLimiter::new(10);
        let start = Instant::now();
        for _ in 0..5 {
            assert!(limiter.acquire().await);
        }
        // First token is free, the next four arrive 100ms apart.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(450), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_rate_does_not_block() {
        let mut limiter = RateLimiter::new(0);
        assert!(limiter.try_acquire());
        assert!(!limiter.acquire().await);

        limiter.set_rate(50);
        assert_eq!(limiter.rate(), 50);
        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(limiter.try_acquire());
    }
}
