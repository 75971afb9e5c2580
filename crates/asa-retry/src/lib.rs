// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Configuration for [`retry`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Upper bound on any single delay, before jitter.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Multiplier applied to `base_delay` for each successive attempt.
    pub exponential_base: f64,
    /// Fraction of the computed delay randomized away (0.0 disables
    /// jitter).
    pub jitter_factor: f64,
    /// Total wall-clock budget across all attempts. Exceeding it aborts
    /// the loop even if attempts remain.
    #[serde(with = "duration_millis")]
    pub overall_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter_factor: 0.25,
            overall_timeout: Duration::from_secs(300),
        }
    }
}

/// One failed attempt recorded in [`RetryMetadata`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// Stringified cause of the failure.
    pub error: String,
    /// Delay slept before the next attempt (zero for the final attempt).
    #[serde(with = "duration_millis")]
    pub delay: Duration,
}

/// Bookkeeping returned alongside a successful [`retry`] result.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetryMetadata {
    /// Total attempts made, including the first and the final success.
    pub total_attempts: u32,
    /// Every failed attempt, in order.
    pub failed_attempts: Vec<RetryAttempt>,
    /// Wall-clock time spent across the whole call, including sleeps.
    #[serde(with = "duration_millis")]
    pub total_duration: Duration,
}

/// A successful [`retry`] call: the operation's result plus metadata
/// about how many attempts it took.
#[derive(Clone, Debug)]
pub struct RetryOutcome<T> {
    /// The operation's return value.
    pub value: T,
    /// Attempt bookkeeping.
    pub metadata: RetryMetadata,
}

/// Errors surfaced by [`retry`].
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed, or the last non-retryable error occurred.
    #[error("retries exhausted after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        /// Attempts made before giving up.
        attempts: u32,
        /// The final attempt's error.
        last_error: E,
    },
    /// The overall timeout elapsed before another attempt could start.
    #[error("retry budget of {budget:?} exceeded, last error: {last_error}")]
    OverallTimeoutExceeded {
        /// The configured overall timeout.
        budget: Duration,
        /// The last error observed before the budget ran out, if any.
        last_error: String,
    },
}

/// Compute the delay for a given (0-indexed) retry attempt, with jitter:
/// exponential growth capped at `max_delay`, then a jitter term derived
/// from the wall clock mixed with the attempt index (not a seeded PRNG —
/// this is a retry backoff, not a security-sensitive draw).
pub fn compute_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = policy.exponential_base.powi(attempt as i32);
    let raw = policy.base_delay.mul_f64(exp).min(policy.max_delay);
    if policy.jitter_factor <= 0.0 {
        return raw;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let mixed = (nanos.wrapping_add(attempt.wrapping_mul(2_654_435_761))) % 1_000_000;
    let frac = mixed as f64 / 1_000_000.0; // [0, 1)
    let jitter = raw.mul_f64(policy.jitter_factor * frac);
    raw.saturating_sub(jitter)
}

/// Retry `op` under `policy`, classifying errors via `is_retryable`.
///
/// Non-retryable errors and the final attempt's error both return
/// immediately via [`RetryError::RetriesExhausted`] without sleeping.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
    is_retryable: impl Fn(&E) -> bool,
) -> Result<RetryOutcome<T>, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start = std::time::Instant::now();
    let mut failed_attempts = Vec::new();

    for attempt in 0..policy.max_attempts {
        if start.elapsed() >= policy.overall_timeout {
            let last_error = failed_attempts
                .last()
                .map(|a: &RetryAttempt| a.error.clone())
                .unwrap_or_else(|| "timed out before first attempt".to_string());
            warn!(target: "asa.retry", attempt, "overall retry timeout exceeded");
            return Err(RetryError::OverallTimeoutExceeded {
                budget: policy.overall_timeout,
                last_error,
            });
        }

        match op().await {
            Ok(value) => {
                return Ok(RetryOutcome {
                    value,
                    metadata: RetryMetadata {
                        total_attempts: attempt + 1,
                        failed_attempts,
                        total_duration: start.elapsed(),
                    },
                })
            }
            Err(err) => {
                let retryable = is_retryable(&err);
                let is_last = attempt + 1 == policy.max_attempts;
                if !retryable || is_last {
                    debug!(target: "asa.retry", attempt, retryable, "giving up");
                    return Err(RetryError::RetriesExhausted {
                        attempts: attempt + 1,
                        last_error: err,
                    });
                }

                let delay = compute_delay(policy, attempt);
                let remaining = policy.overall_timeout.saturating_sub(start.elapsed());
                let sleep_for = delay.min(remaining);
                warn!(
                    target: "asa.retry",
                    attempt,
                    delay_ms = sleep_for.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                failed_attempts.push(RetryAttempt {
                    attempt: attempt + 1,
                    error: err.to_string(),
                    delay: sleep_for,
                });
                tokio::time::sleep(sleep_for).await;
            }
        }
    }

    unreachable!("loop always returns before exhausting max_attempts iterations")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_without_retry() {
        let policy = RetryPolicy::default();
        let result = retry(&policy, || async { Ok::<_, String>(42) }, |_| true).await;
        let outcome = result.unwrap();
        assert_eq!(outcome.value, 42);
        assert_eq!(outcome.metadata.total_attempts, 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            overall_timeout: Duration::from_secs(5),
            ..RetryPolicy::default()
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let result = retry(
            &policy,
            move || {
                let a = a.clone();
                async move {
                    let n = a.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok(7)
                    }
                }
            },
            |_| true,
        )
        .await
        .unwrap();
        assert_eq!(result.value, 7);
        assert_eq!(result.metadata.total_attempts, 3);
        assert_eq!(result.metadata.failed_attempts.len(), 2);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let policy = RetryPolicy::default();
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let result = retry(
            &policy,
            move || {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>("auth".to_string())
                }
            },
            |_| false,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn compute_delay_respects_max() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            exponential_base: 2.0,
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(compute_delay(&policy, 0), Duration::from_secs(1));
        assert_eq!(compute_delay(&policy, 1), Duration::from_secs(2));
        assert_eq!(compute_delay(&policy, 5), Duration::from_secs(4));
    }
}
