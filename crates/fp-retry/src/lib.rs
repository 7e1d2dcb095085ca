// SPDX-License-Identifier: MIT OR Apache-2.0
//! Jittered exponential backoff shared by the package cache's object-store
//! fetch path and the isolate pool's spawn path (§7 "recoverable errors are
//! retried locally; unrecoverable errors become the response status").
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Serde helper — `Duration` as integer milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        val.as_millis().serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let ms: u64 = u64::deserialize(de)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Backoff configuration for a retry-enabled operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the initial attempt
    /// (`MaxFetchRetries` in the platform contract's configuration table).
    /// `0` means only the initial attempt (no retries).
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Maximum delay cap for exponential backoff.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Overall wall-clock timeout across all attempts.
    #[serde(with = "duration_millis")]
    pub overall_timeout: Duration,
    /// Jitter factor in `[0.0, 1.0]`. 0 = no jitter, 1 = full jitter.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            overall_timeout: Duration::from_secs(30),
            jitter_factor: 0.5,
        }
    }
}

/// Record of a single failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// Zero-indexed attempt number.
    pub attempt: u32,
    /// Error message from this attempt.
    pub error: String,
    /// Backoff delay applied before the next attempt.
    #[serde(with = "duration_millis")]
    pub delay: Duration,
}

/// Metadata captured across all retry attempts, suitable for embedding in
/// an execution log or diagnostic context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryMetadata {
    /// Total number of attempts made (including the successful one, if any).
    pub total_attempts: u32,
    /// Records of each *failed* attempt.
    pub failed_attempts: Vec<RetryAttempt>,
    /// Wall-clock time spanning all attempts.
    #[serde(with = "duration_millis")]
    pub total_duration: Duration,
}

/// Result of a retry-enabled operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The successfully produced value.
    pub value: T,
    /// Retry metadata (empty `failed_attempts` when the first attempt succeeds).
    pub metadata: RetryMetadata,
}

/// Errors surfaced by [`retry_async`] itself (distinct from the operation's
/// own error type, which is returned verbatim on non-retryable or
/// exhausted failure).
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The overall timeout elapsed before an attempt could succeed.
    #[error("retry budget exhausted after {attempts} attempt(s) in {elapsed:?}")]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Wall-clock time spent.
        elapsed: Duration,
        /// The last operation error observed.
        #[source]
        last: E,
    },
}

/// Compute the backoff delay for a given zero-indexed attempt number.
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = 2u64.saturating_pow(attempt);
    let delay_ms = (config.base_delay.as_millis() as u64).saturating_mul(exp);
    let capped_ms = delay_ms.min(config.max_delay.as_millis() as u64);

    let jitter_factor = config.jitter_factor.clamp(0.0, 1.0);
    if jitter_factor > 0.0 && capped_ms > 0 {
        let jitter_range = (capped_ms as f64 * jitter_factor) as u64;
        // Cheap pseudo-random: system-clock nanos mixed with attempt index.
        // Not cryptographic — only used to spread concurrent retries apart.
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u64;
        let pseudo = nanos.wrapping_mul(attempt as u64 + 1);
        let jitter = if jitter_range > 0 {
            pseudo % jitter_range
        } else {
            0
        };
        Duration::from_millis(capped_ms.saturating_sub(jitter))
    } else {
        Duration::from_millis(capped_ms)
    }
}

/// Generic retry loop. Calls `op` up to `config.max_retries + 1` times with
/// exponential backoff, returning the first successful result along with
/// metadata about failed attempts.
///
/// `retryable` decides whether a given error should trigger another
/// attempt; a `false` result (or an elapsed overall timeout) returns
/// immediately with [`RetryError::Exhausted`] wrapping the last error.
pub async fn retry_async<T, E, F, Fut>(
    config: &RetryConfig,
    mut op: F,
    retryable: impl Fn(&E) -> bool,
) -> Result<RetryOutcome<T>, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let max_attempts = config.max_retries + 1;
    let mut failed_attempts = Vec::new();

    for attempt in 0..max_attempts {
        match op().await {
            Ok(value) => {
                let total_duration = start.elapsed();
                debug!(
                    target: "fp.retry",
                    attempt,
                    total_duration_ms = total_duration.as_millis() as u64,
                    "operation succeeded"
                );
                return Ok(RetryOutcome {
                    value,
                    metadata: RetryMetadata {
                        total_attempts: attempt + 1,
                        failed_attempts,
                        total_duration,
                    },
                });
            }
            Err(err) => {
                let is_last = attempt + 1 >= max_attempts;
                let elapsed = start.elapsed();

                if !retryable(&err) || is_last || elapsed >= config.overall_timeout {
                    warn!(
                        target: "fp.retry",
                        error = %err,
                        attempt,
                        "giving up"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        elapsed,
                        last: err,
                    });
                }

                let delay = compute_delay(config, attempt);
                let remaining = config.overall_timeout.saturating_sub(elapsed);
                let delay = delay.min(remaining);

                warn!(
                    target: "fp.retry",
                    error = %err,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retryable error, backing off"
                );
                failed_attempts.push(RetryAttempt {
                    attempt,
                    error: err.to_string(),
                    delay,
                });
                tokio::time::sleep(delay).await;
            }
        }
    }

    unreachable!("loop always returns by the last iteration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            overall_timeout: Duration::from_secs(5),
            jitter_factor: 0.0,
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_try_without_retrying() {
        let calls = AtomicU32::new(0);
        let outcome = retry_async(
            &fast_config(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(42) }
            },
            |_: &String| true,
        )
        .await
        .unwrap();
        assert_eq!(outcome.value, 42);
        assert_eq!(outcome.metadata.total_attempts, 1);
        assert!(outcome.metadata.failed_attempts.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let calls = AtomicU32::new(0);
        let outcome = retry_async(
            &fast_config(),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok(n)
                    }
                }
            },
            |_: &String| true,
        )
        .await
        .unwrap();
        assert_eq!(outcome.value, 2);
        assert_eq!(outcome.metadata.total_attempts, 3);
        assert_eq!(outcome.metadata.failed_attempts.len(), 2);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result = retry_async(
            &fast_config(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<u32, _>("fatal".to_string()) }
            },
            |_: &String| false,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_after_max_retries() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 2,
            ..fast_config()
        };
        let result = retry_async(
            &config,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<u32, _>("always fails".to_string()) }
            },
            |_: &String| true,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3); // initial + 2 retries
        match result.unwrap_err() {
            RetryError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
        }
    }

    #[test]
    fn compute_delay_is_capped_at_max_delay() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter_factor: 0.0,
            ..fast_config()
        };
        let delay = compute_delay(&config, 10); // would be huge without capping
        assert!(delay <= Duration::from_millis(500));
    }

    #[test]
    fn compute_delay_grows_exponentially_without_jitter() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.0,
            ..fast_config()
        };
        assert_eq!(compute_delay(&config, 0), Duration::from_millis(10));
        assert_eq!(compute_delay(&config, 1), Duration::from_millis(20));
        assert_eq!(compute_delay(&config, 2), Duration::from_millis(40));
    }
}
