//! Retry Logic
//!
//! Automatic retry with backoff for transient failures.
//!
//! ## Usage
//!
//! ```no_run
//! use rollout_router::resilience::RetryPolicy;
//! use rollout_router::RouterError;
//! use std::time::Duration;
//! # #[tokio::main]
//! # async fn main() {
//! let policy = RetryPolicy::exponential(3, Duration::from_millis(200));
//!
//! let result = policy
//!     .retry_if(
//!         || async { Ok::<_, RouterError>("completion") },
//!         RouterError::is_transient,
//!     )
//!     .await;
//! # let _ = result;
//! # }
//! ```

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy configuration.
///
/// `max_retries` counts retries, not attempts: a policy with three retries
/// makes at most four calls.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    /// Delay schedule.
    pub strategy: RetryStrategy,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

/// Retry backoff strategy.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryStrategy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: `initial_delay × multiplier^(retry-1)`, capped.
    Exponential {
        /// Delay before the first retry.
        initial_delay: Duration,
        /// Upper bound on any delay.
        max_delay: Duration,
        /// Growth factor per retry.
        multiplier: f64,
    },
}

impl RetryPolicy {
    /// Policy with a fixed delay and no jitter.
    pub fn fixed(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_retries,
            strategy: RetryStrategy::Fixed(delay),
            jitter: false,
        }
    }

    /// Doubling backoff (1×, 2×, 4× …) capped at 60 s, no jitter.
    pub fn exponential(max_retries: usize, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            strategy: RetryStrategy::Exponential {
                initial_delay,
                max_delay: Duration::from_secs(60),
                multiplier: 2.0,
            },
            jitter: false,
        }
    }

    /// Override the delay cap (exponential strategy only).
    pub fn with_max_delay(mut self, cap: Duration) -> Self {
        if let RetryStrategy::Exponential { max_delay, .. } = &mut self.strategy {
            *max_delay = cap;
        }
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Base delay before retry number `retry` (1-based), before jitter.
    pub fn base_delay(&self, retry: usize) -> Duration {
        match &self.strategy {
            RetryStrategy::Fixed(delay) => *delay,
            RetryStrategy::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let exp = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
                let millis = initial_delay.as_millis() as f64 * multiplier.powi(exp);
                let capped = millis.min(max_delay.as_millis() as f64);
                Duration::from_millis(capped as u64)
            }
        }
    }

    /// Delay actually slept before retry number `retry` (1-based).
    ///
    /// Jitter is drawn from `[0, 25%)` of the base delay and the result is
    /// capped at `max_delay`. Because each base delay is at least twice the
    /// previous one, jittered delays stay non-decreasing.
    pub fn calculate_delay(&self, retry: usize) -> Duration {
        let base = self.base_delay(retry);
        if !self.jitter {
            return base;
        }
        let jittered = with_jitter(base);
        match &self.strategy {
            RetryStrategy::Exponential { max_delay, .. } => jittered.min(*max_delay),
            RetryStrategy::Fixed(_) => jittered,
        }
    }

    /// Run `f`, retrying every error.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted.
    pub async fn retry<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.retry_if(f, |_| true).await
    }

    /// Run `f`, retrying only errors for which `should_retry` holds.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error immediately, or the last
    /// error once retries are exhausted.
    pub async fn retry_if<F, Fut, T, E, P>(&self, mut f: F, mut should_retry: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut retry = 0;

        loop {
            match f().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!(retries = retry, "retry: operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if !should_retry(&e) {
                        debug!(error = %e, "retry: error is not retryable");
                        return Err(e);
                    }
                    if retry >= self.max_retries {
                        warn!(attempts = retry + 1, error = %e, "retry: all attempts exhausted");
                        return Err(e);
                    }

                    retry += 1;
                    let delay = self.calculate_delay(retry);
                    warn!(
                        attempt = retry,
                        max = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retry: transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    /// Three retries at 200 ms, 400 ms, 800 ms with jitter.
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(5))
            .with_jitter(true)
    }
}

/// Add up to 25% random jitter to prevent synchronized retries.
pub fn with_jitter(duration: Duration) -> Duration {
    use rand::Rng;
    let quarter = duration.as_millis() / 4;
    if quarter == 0 {
        return duration;
    }
    let jitter = rand::thread_rng().gen_range(0..quarter);
    duration + Duration::from_millis(u64::try_from(jitter).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_succeeds_eventually() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));

        let result = policy
            .retry(|| {
                let attempts = attempts_clone.clone();
                async move {
                    let count = attempts.fetch_add(1, Ordering::SeqCst);
                    if count < 2 {
                        Err("failing")
                    } else {
                        Ok("success")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_makes_at_most_max_retries_plus_one_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let policy = RetryPolicy::exponential(3, Duration::from_millis(100));

        let result = policy
            .retry(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("always fails")
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_exponential_backoff_doubles() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(10));

        assert_eq!(policy.calculate_delay(1), Duration::from_millis(10));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(20));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(40));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(250));
        assert_eq!(policy.calculate_delay(5), Duration::from_millis(250));
    }

    #[test]
    fn test_jittered_delays_are_non_decreasing() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let delays: Vec<Duration> = (1..=3).map(|r| policy.calculate_delay(r)).collect();
            assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{delays:?}");
        }
    }

    #[tokio::test]
    async fn test_retry_if_stops_on_permanent_error() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));

        let result = policy
            .retry_if(
                || {
                    let attempts = attempts_clone.clone();
                    async move {
                        let count = attempts.fetch_add(1, Ordering::SeqCst);
                        if count == 0 {
                            Err("transient")
                        } else {
                            Err::<(), _>("permanent")
                        }
                    }
                },
                |e| *e == "transient",
            )
            .await;

        assert_eq!(result.unwrap_err(), "permanent");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    /// Run a policy against an always-failing operation and return the
    /// gaps between consecutive attempts.
    async fn attempt_gaps(policy: &RetryPolicy) -> Vec<Duration> {
        let stamps = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorder = stamps.clone();
        let _ = policy
            .retry(|| {
                let recorder = recorder.clone();
                async move {
                    recorder.lock().push(tokio::time::Instant::now());
                    Err::<(), _>("unavailable")
                }
            })
            .await;
        let stamps = stamps.lock();
        stamps.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_sleeps_increase_until_cap() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));

        let gaps = attempt_gaps(&policy).await;
        let expected: Vec<Duration> = [100, 200, 400, 500, 500]
            .into_iter()
            .map(Duration::from_millis)
            .collect();
        assert_eq!(gaps, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jittered_retry_sleeps_strictly_increase() {
        let policy = RetryPolicy::default();
        for _ in 0..20 {
            let gaps = attempt_gaps(&policy).await;
            assert_eq!(gaps.len(), 3);
            assert!(gaps.windows(2).all(|w| w[0] < w[1]), "{gaps:?}");
            for (gap, base) in gaps.iter().zip([200u64, 400, 800]) {
                let base = Duration::from_millis(base);
                assert!(*gap >= base && *gap < base + base / 4, "{gap:?} vs {base:?}");
            }
        }
    }

    #[test]
    fn test_jitter() {
        let base = Duration::from_secs(1);
        let jittered = with_jitter(base);

        assert!(jittered >= base);
        assert!(jittered < base + Duration::from_millis(250));
    }

    #[test]
    fn test_jitter_on_tiny_delay_is_identity() {
        assert_eq!(with_jitter(Duration::from_millis(3)), Duration::from_millis(3));
    }
}
