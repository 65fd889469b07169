use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 2_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            1.0
        };
        let raw = self.initial_backoff_ms as f64 * multiplier.powi(exponent);
        let capped = raw.min(self.max_backoff_ms.max(self.initial_backoff_ms) as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

#[derive(Debug)]
pub struct Retried<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Runs `op` until it succeeds, fails with a non-retriable error, or the
/// policy's attempts are spent. `on_retry` sees each retriable failure
/// together with the delay about to be slept.
pub async fn retry_with_backoff<T, E, F, Fut, R, N>(
    policy: &RetryPolicy,
    mut op: F,
    should_retry: R,
    mut on_retry: N,
) -> Retried<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    N: FnMut(u32, &E, Duration),
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) => {
                if attempt >= max_attempts || !should_retry(&err) {
                    return Retried {
                        result: Err(err),
                        attempts: attempt,
                    };
                }
                let delay = policy.delay_after(attempt);
                on_retry(attempt, &err, delay);
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            multiplier: 2.0,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(200));
        assert_eq!(policy.delay_after(2), Duration::from_millis(400));
        assert_eq!(policy.delay_after(3), Duration::from_millis(800));
        assert_eq!(policy.delay_after(10), Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();
        let outcome: Retried<(), String> = retry_with_backoff(
            &fast_policy(3),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("boom".to_string()) }
            },
            |_| true,
            |attempt, _, _| retries.push(attempt),
        )
        .await;
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test]
    async fn non_retriable_error_returns_immediately() {
        let outcome: Retried<(), &str> =
            retry_with_backoff(&fast_policy(5), |_| async { Err("fatal") }, |_| false, |_, _, _| {})
                .await;
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn recovers_on_later_attempt() {
        let outcome = retry_with_backoff(
            &fast_policy(3),
            |attempt| async move {
                if attempt < 2 {
                    Err("transient")
                } else {
                    Ok(attempt)
                }
            },
            |_| true,
            |_, _, _| {},
        )
        .await;
        assert_eq!(outcome.result, Ok(2));
        assert_eq!(outcome.attempts, 2);
    }
}
