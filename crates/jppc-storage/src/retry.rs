//! Bounded retry with exponential backoff and jitter.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Errors that know whether repeating the same step may succeed.
pub trait Transience {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative jitter applied to each backoff, e.g. `0.25` for ±25%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStop {
    Permanent,
    Exhausted,
    Cancelled,
}

#[derive(Debug, Error)]
#[error("gave up after {attempts} attempt(s): {error}")]
pub struct RetryError<E> {
    pub attempts: u32,
    pub stop: RetryStop,
    #[source]
    pub error: E,
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    fn jittered_delay(&self, attempt_index: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        let spread = self.jitter.clamp(0.0, 1.0);
        if spread == 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::random_range(-spread..=spread);
        delay.mul_f64(factor).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails permanently, exhausts the attempt budget, or
    /// `cancel` fires during a backoff wait. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transience + fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let error = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_transient() {
                return Err(RetryError {
                    attempts: attempt,
                    stop: RetryStop::Permanent,
                    error,
                });
            }
            if attempt >= max_attempts {
                return Err(RetryError {
                    attempts: attempt,
                    stop: RetryStop::Exhausted,
                    error,
                });
            }

            let delay = self.jittered_delay(attempt - 1);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                %error,
                "transient failure, backing off"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError {
                        attempts: attempt,
                        stop: RetryStop::Cancelled,
                        error,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    enum StepError {
        Flaky,
        Broken,
    }

    impl fmt::Display for StepError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Transience for StepError {
        fn is_transient(&self) -> bool {
            matches!(self, StepError::Flaky)
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: 0.25,
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = policy();
        for _ in 0..200 {
            let delay = policy.jittered_delay(1);
            assert!(delay >= Duration::from_millis(149));
            assert!(delay <= Duration::from_millis(251));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_max_minus_one_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = policy()
            .run(&CancellationToken::new(), move |attempt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(StepError::Flaky)
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .expect("third attempt succeeds");
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_transient_failures() {
        let err = policy()
            .run(&CancellationToken::new(), |_| async {
                Err::<(), _>(StepError::Flaky)
            })
            .await
            .expect_err("always flaky");
        assert_eq!(err.attempts, 3);
        assert_eq!(err.stop, RetryStop::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let err = policy()
            .run(&CancellationToken::new(), |_| async {
                Err::<(), _>(StepError::Broken)
            })
            .await
            .expect_err("broken");
        assert_eq!(err.attempts, 1);
        assert_eq!(err.stop, RetryStop::Permanent);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            ..policy()
        };
        let run = policy.run(&cancel, |_| async { Err::<(), _>(StepError::Flaky) });
        let (result, _) = tokio::join!(run, async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let err = result.expect_err("cancelled");
        assert_eq!(err.stop, RetryStop::Cancelled);
        assert_eq!(err.attempts, 1);
    }
}
