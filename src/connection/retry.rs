//! Exponential backoff for transport-layer retries (§4.6, §7).
//!
//! Transient connection errors (refused, reset, timeout) are retried with
//! backoff `1s, 2s, 4s, ...` up to a configured attempt count; authentication
//! failures are terminal and never retried. Kept close to the teacher's
//! `BackoffStrategy`/`RetryPolicy` shape, trimmed to the strategies and
//! error taxonomy this crate actually has a use for.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::Error;

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Exponential increase: `delay * multiplier^attempt`.
    Exponential,
    /// Exponential with jitter, for avoiding thundering-herd reconnects.
    ExponentialWithJitter,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Configuration for retry behavior (§4.6: "exponential backoff (1s, 2s, 4s)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 means no retries).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial delay between retries.
    #[serde(default = "default_initial_delay")]
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (caps exponential growth).
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Backoff strategy to use.
    #[serde(default)]
    pub strategy: BackoffStrategy,

    /// Multiplier for exponential backoff (default: 2.0, giving 1s/2s/4s).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0) applied only under `ExponentialWithJitter`.
    #[serde(default)]
    pub jitter: f64,

    /// Whether to retry on authentication failures. Always `false` per §7;
    /// exposed only so tests can exercise the opposite behavior explicitly.
    #[serde(default)]
    pub retry_on_auth_failure: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            strategy: BackoffStrategy::default(),
            multiplier: default_multiplier(),
            jitter: 0.0,
            retry_on_auth_failure: false,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with defaults matching §4.6's 1s/2s/4s sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set the maximum number of retries.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff strategy.
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter factor, clamped to `[0.0, 1.0]`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate the delay for a given (zero-based) attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = match self.strategy {
            BackoffStrategy::Fixed => self.initial_delay,
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialWithJitter => {
                self.initial_delay
                    .mul_f64(self.multiplier.powi(attempt as i32))
            }
        };

        let capped_delay = base_delay.min(self.max_delay);

        if self.strategy == BackoffStrategy::ExponentialWithJitter && self.jitter > 0.0 {
            let jitter_range = capped_delay.as_secs_f64() * self.jitter;
            let jitter_value = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            let jittered_secs = (capped_delay.as_secs_f64() + jitter_value).max(0.0);
            Duration::from_secs_f64(jittered_secs)
        } else {
            capped_delay
        }
    }

    /// Whether `error` is worth retrying under this policy (§7: auth is terminal).
    pub fn is_retryable(&self, error: &Error) -> bool {
        match error {
            Error::AuthenticationFailed { .. } => self.retry_on_auth_failure,
            Error::ConnectionFailed { .. } | Error::ConnectionTimeout { .. } => true,
            _ => false,
        }
    }
}

/// Statistics about retry attempts.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Total number of attempts made.
    pub total_attempts: u32,
    /// Total time spent across all attempts and waits.
    pub total_duration: Duration,
    /// The errors encountered during retries, in order.
    pub errors: Vec<String>,
}

impl RetryStats {
    fn record_attempt(&mut self, duration: Duration) {
        self.total_attempts += 1;
        self.total_duration += duration;
    }

    fn record_wait(&mut self, wait: Duration) {
        self.total_duration += wait;
    }
}

/// Execute `operation` with retry logic per `policy`, returning the final
/// result and bookkeeping about how many attempts it took.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> (Result<T, Error>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut stats = RetryStats::default();
    let mut last_error = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.delay_for_attempt(attempt - 1);
            debug!(attempt, ?delay, "waiting before retry attempt");
            stats.record_wait(delay);
            tokio::time::sleep(delay).await;
        }

        let attempt_start = std::time::Instant::now();
        trace!(attempt, "starting attempt");
        let result = operation().await;
        stats.record_attempt(attempt_start.elapsed());

        match result {
            Ok(value) => return (Ok(value), stats),
            Err(e) => {
                stats.errors.push(e.to_string());
                if !policy.is_retryable(&e) {
                    debug!(error = %e, "non-retryable error, stopping");
                    return (Err(e), stats);
                }
                warn!(attempt, max_retries = policy.max_retries, error = %e, "attempt failed, will retry");
                last_error = Some(e);
            }
        }
    }

    let error = last_error.unwrap_or_else(|| Error::ConnectionFailed {
        host: "unknown".to_string(),
        message: "max retries exceeded".to_string(),
    });
    (Err(error), stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_spec_backoff_sequence() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn delay_caps_at_max() {
        let policy = RetryPolicy::new().with_max_delay(Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(3));
    }

    #[test]
    fn auth_failures_are_not_retryable_by_default() {
        let policy = RetryPolicy::default();
        let err = Error::AuthenticationFailed {
            user: "root".to_string(),
            host: "h1".to_string(),
            method: "private-key".to_string(),
            message: "denied".to_string(),
        };
        assert!(!policy.is_retryable(&err));
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let policy = RetryPolicy::new()
            .with_initial_delay(Duration::from_millis(5))
            .with_max_retries(3);
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let (result, stats) = retry(&policy, || {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err(Error::ConnectionFailed {
                        host: "h1".to_string(),
                        message: "refused".to_string(),
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(stats.total_attempts, 3);
    }

    #[tokio::test]
    async fn retry_stops_immediately_on_auth_failure() {
        let policy = RetryPolicy::new().with_max_retries(5);
        let (result, stats) = retry(&policy, || async {
            Err::<i32, _>(Error::AuthenticationFailed {
                user: "root".to_string(),
                host: "h1".to_string(),
                method: "password".to_string(),
                message: "denied".to_string(),
            })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(stats.total_attempts, 1);
    }
}
