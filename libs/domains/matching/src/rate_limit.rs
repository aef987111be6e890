//! Token-bucket rate limiter for outbound embedding API calls.
//!
//! Tokens are recomputed lazily from elapsed wall-clock time; there is no
//! background refill timer. State is process-local: it resets on restart,
//! and multiple instances each enforce the configured rate independently
//! (effective aggregate rate = configured rate x instance count).

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{MatchingError, MatchingResult};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket bounding the rate of outbound calls.
#[derive(Debug)]
pub struct TokenBucket {
    /// Tokens added per interval.
    rate: f64,
    interval: Duration,
    /// Maximum tokens the bucket can hold.
    max_burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Construct with an explicit refill rate, interval, and burst ceiling.
    /// The bucket starts full.
    pub fn new(refill_per_interval: u32, interval: Duration, max_burst: u32) -> Self {
        let max = f64::from(max_burst.max(1));
        Self {
            rate: f64::from(refill_per_interval.max(1)),
            interval,
            max_burst: max,
            state: Mutex::new(BucketState {
                tokens: max,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Construct with `rate` tokens per second and burst = rate.
    pub fn per_second(rate: u32) -> Self {
        Self::new(rate, Duration::from_secs(1), rate)
    }

    /// Recompute available tokens from elapsed time, then take one if at
    /// least one is available. Returns whether a token was taken.
    pub async fn try_take(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take a token, suspending once for the computed refill delay if none
    /// is available.
    ///
    /// With a caller timeout, fails fast with [`MatchingError::RateLimitTimeout`]
    /// when the wait needed for one token already exceeds the budget. A
    /// second miss after sleeping returns [`MatchingError::RateLimitExhausted`];
    /// that indicates heavier contention than the bucket is configured for.
    pub async fn wait_for_token(&self, timeout: Option<Duration>) -> MatchingResult<()> {
        let wait = {
            let mut state = self.state.lock().await;
            self.refill(&mut state);

            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                return Ok(());
            }

            // Time until one whole token has accumulated.
            let missing = 1.0 - state.tokens;
            self.interval.mul_f64(missing / self.rate)
        };

        if let Some(budget) = timeout
            && wait > budget
        {
            tracing::debug!(?wait, ?budget, "Rate limit wait exceeds caller timeout");
            return Err(MatchingError::RateLimitTimeout);
        }

        tokio::time::sleep(wait).await;

        if self.try_take().await {
            Ok(())
        } else {
            tracing::warn!("Token bucket still empty after waiting {:?}", wait);
            Err(MatchingError::RateLimitExhausted)
        }
    }

    /// Available tokens right now (diagnostic).
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }

        let earned = elapsed.as_secs_f64() / self.interval.as_secs_f64() * self.rate;
        state.tokens = (state.tokens + earned).min(self.max_burst);
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn bucket_starts_full_and_decrements_per_take() {
        let bucket = TokenBucket::per_second(3);
        assert_eq!(bucket.available().await, 3.0);

        assert!(bucket.try_take().await);
        assert!(bucket.try_take().await);
        assert!(bucket.try_take().await);
        assert!(!bucket.try_take().await);
        assert_eq!(bucket.available().await, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_never_exceed_max_burst() {
        let bucket = TokenBucket::per_second(2);
        advance(Duration::from_secs(100)).await;
        assert_eq!(bucket.available().await, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_bounded_by_elapsed_time() {
        let bucket = TokenBucket::per_second(4);
        for _ in 0..4 {
            assert!(bucket.try_take().await);
        }

        // After 500ms at 4/s, at most 2 tokens have accumulated.
        advance(Duration::from_millis(500)).await;
        let available = bucket.available().await;
        assert!(available <= 2.0 + f64::EPSILON, "available = {available}");

        assert!(bucket.try_take().await);
        assert!(bucket.try_take().await);
        assert!(!bucket.try_take().await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_token_sleeps_then_succeeds() {
        let bucket = TokenBucket::per_second(1);
        assert!(bucket.try_take().await);

        // Paused clock: the sleep inside wait_for_token auto-advances.
        bucket.wait_for_token(None).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_token_fails_fast_on_tight_timeout() {
        let bucket = TokenBucket::new(1, Duration::from_secs(10), 1);
        assert!(bucket.try_take().await);

        let err = bucket
            .wait_for_token(Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, MatchingError::RateLimitTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn generous_timeout_allows_the_wait() {
        let bucket = TokenBucket::per_second(2);
        assert!(bucket.try_take().await);
        assert!(bucket.try_take().await);

        bucket
            .wait_for_token(Some(Duration::from_secs(5)))
            .await
            .unwrap();
    }
}
