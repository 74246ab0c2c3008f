//! Retry policies.
//!
//! Two consumers: provider adapters retry transient upstream failures
//! internally, and the runner drives its own per-step retry loop (so it can
//! emit `step_retrying` events between attempts).

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::LacquerError;

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub use_jitter: bool,
    /// Maximum jitter fraction of the computed delay (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            use_jitter: true,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub const fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub const fn with_jitter(mut self, use_jitter: bool) -> Self {
        self.use_jitter = use_jitter;
        self
    }

    /// Fixed-delay policy: every wait is `delay`, no jitter.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            use_jitter: false,
            jitter_factor: 0.0,
        }
    }

    pub fn should_retry(&self, error: &LacquerError) -> bool {
        error.is_retryable()
    }

    /// Delay before the attempt following failed attempt `attempt` (0-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        let delay = Duration::from_millis(base as u64).min(self.max_delay);
        if self.use_jitter {
            self.add_jitter(delay)
        } else {
            delay
        }
    }

    fn add_jitter(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();
        let jitter_range = delay.as_millis() as f64 * self.jitter_factor;
        if jitter_range <= 0.0 {
            return delay;
        }
        let jitter = rng.gen_range(-jitter_range..=jitter_range);
        Duration::from_millis((delay.as_millis() as f64 + jitter).max(0.0) as u64)
    }
}

/// Sleep for `delay` unless `cancel` fires first.
///
/// Returns `Err(Cancelled)` without completing the sleep when the token
/// fires, so a cancelled run never waits out a retry delay.
pub async fn sleep_cancellable(
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), LacquerError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(LacquerError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Drives an operation through a [`RetryPolicy`].
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, LacquerError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, LacquerError>>,
    {
        let mut last_error = None;

        for attempt in 0..self.policy.max_attempts {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    if !self.policy.should_retry(&error) {
                        return Err(error);
                    }
                    last_error = Some(error);
                    if attempt == self.policy.max_attempts - 1 {
                        break;
                    }
                    tokio::time::sleep(self.policy.calculate_delay(attempt)).await;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| LacquerError::internal("retry executor finished without error")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_success_on_second_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let executor = RetryExecutor::new(policy);

        let result = executor
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(LacquerError::api(500, "server error"))
                    } else {
                        Ok("success")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_short_circuits() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let executor = RetryExecutor::new(RetryPolicy::fixed(5, Duration::from_millis(1)));
        let result: Result<(), _> = executor
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(LacquerError::api(400, "bad request"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(policy.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new()
            .with_initial_delay(Duration::from_secs(30))
            .with_max_delay(Duration::from_secs(45))
            .with_jitter(false);
        assert_eq!(policy.calculate_delay(3), Duration::from_secs(45));
    }

    #[tokio::test]
    async fn test_cancellable_sleep_terminates_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let start = std::time::Instant::now();
        let result = sleep_cancellable(Duration::from_secs(30), &token).await;
        assert!(matches!(result, Err(LacquerError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
