//! SF-022: Exponential backoff for transient platform errors.

use crate::core::types::RetryPolicy;
use crate::error::PlatformError;
use std::future::Future;
use std::time::Duration;

/// Delay after the `attempt`-th failure (1-based):
/// `initial * multiplier^(attempt-1)`, capped at `max_delay_ms`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(64) as i32;
    let ms = policy.initial_delay_ms as f64 * policy.backoff_multiplier.powi(exponent);
    let capped = ms.min(policy.max_delay_ms as f64).max(0.0);
    Duration::from_millis(capped as u64)
}

/// Result of a retried operation.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: Result<T, PlatformError>,
    /// Attempts made, including the last one
    pub attempts: u32,
    /// Error text of every failed attempt, in order
    pub failures: Vec<String>,
}

impl<T> Retried<T> {
    pub fn failed_attempts(&self) -> u32 {
        self.failures.len() as u32
    }
}

/// Run `op` until it succeeds, fails non-transiently, or exhausts
/// `max_attempts`. `op` receives the 1-based attempt number.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Retried<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, PlatformError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut failures = Vec::new();
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                return Retried {
                    value: Ok(value),
                    attempts: attempt,
                    failures,
                }
            }
            Err(err) => {
                failures.push(err.to_string());
                if !err.is_transient() || attempt >= max_attempts {
                    return Retried {
                        value: Err(err),
                        attempts: attempt,
                        failures,
                    };
                }
                let delay = backoff_delay(policy, attempt);
                tracing::warn!(
                    operation = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_multiplier: 2.0,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
        }
    }

    #[test]
    fn test_sf022_backoff_growth_and_cap() {
        let p = policy(10);
        assert_eq!(backoff_delay(&p, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&p, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&p, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(&p, 5), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&p, 500), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sf022_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let r = with_retry(&policy(3), "t", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(PlatformError::Transient("blip".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(r.failed_attempts(), 2);
        assert_eq!(r.value.unwrap(), 2);
        assert_eq!(r.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sf022_exhaustion() {
        let r: Retried<()> = with_retry(&policy(2), "t", |_| async {
            Err(PlatformError::Transient("down".into()))
        })
        .await;
        assert!(r.value.is_err());
        assert_eq!(r.attempts, 2);
        assert_eq!(r.failures.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sf022_non_transient_not_retried() {
        let r: Retried<()> = with_retry(&policy(5), "t", |_| async {
            Err(PlatformError::Quota("no cores".into()))
        })
        .await;
        assert!(matches!(r.value, Err(PlatformError::Quota(_))));
        assert_eq!(r.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sf022_backoff_sleeps() {
        let start = tokio::time::Instant::now();
        let _: Retried<()> = with_retry(&policy(3), "t", |_| async {
            Err(PlatformError::Transient("x".into()))
        })
        .await;
        // 100ms + 200ms of backoff between three attempts
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(400));
    }
}
