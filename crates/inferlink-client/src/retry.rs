//! Retry policy and retry driver.
//!
//! [`RetryPolicy::delay`] maps an attempt number to a backoff duration and
//! [`RetryPolicy::should_retry`] decides whether a failure is worth another
//! attempt.  [`RetryPolicy::run`] drives an operation that reports each
//! attempt as a tagged [`Attempt`], sleeping cooperatively between tries.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::serde_secs;
use crate::error::{ErrorKind, InferenceError, Result};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Always `base_delay`.
    FixedDelay,
    /// `base_delay * (attempt + 1)`.
    LinearBackoff,
    /// `base_delay * multiplier^attempt`.
    #[default]
    ExponentialBackoff,
}

/// Retry settings for a single logical request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    #[serde(with = "serde_secs")]
    pub base_delay: Duration,
    /// Upper bound for every computed delay.
    #[serde(with = "serde_secs")]
    pub max_delay: Duration,
    pub strategy: RetryStrategy,
    pub retry_on_timeout: bool,
    pub retry_on_connection_error: bool,
    pub retry_on_server_error: bool,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: RetryStrategy::ExponentialBackoff,
            retry_on_timeout: true,
            retry_on_connection_error: true,
            retry_on_server_error: true,
            backoff_multiplier: 2.0,
        }
    }
}

/// Outcome of one attempt, as reported by the transport.
#[derive(Debug)]
pub enum Attempt<T> {
    /// The attempt succeeded.
    Ok(T),
    /// The attempt failed with a transient error; the policy decides whether
    /// to try again.
    Retryable(InferenceError),
    /// The attempt failed in a way that another attempt cannot fix.
    Fatal(InferenceError),
}

impl<T> Attempt<T> {
    /// Tag a plain result by the kind of its error.
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(err) => match err.kind() {
                ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::Server => {
                    Self::Retryable(err)
                }
                _ => Self::Fatal(err),
            },
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Attempt<U> {
        match self {
            Self::Ok(value) => Attempt::Ok(f(value)),
            Self::Retryable(err) => Attempt::Retryable(err),
            Self::Fatal(err) => Attempt::Fatal(err),
        }
    }

    /// Drop the retry tag.
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Retryable(err) | Self::Fatal(err) => Err(err),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Reject settings that would make delays meaningless.
    pub fn validate(&self) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(InferenceError::Config {
                reason: format!(
                    "backoff_multiplier must be a finite value >= 1.0, got {}",
                    self.backoff_multiplier
                ),
            });
        }
        Ok(())
    }

    /// Backoff before retry number `attempt + 1`.  Never exceeds `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = match self.strategy {
            RetryStrategy::FixedDelay => Some(self.base_delay),
            RetryStrategy::LinearBackoff => {
                self.base_delay.checked_mul(attempt.saturating_add(1))
            }
            RetryStrategy::ExponentialBackoff => {
                let secs = self.base_delay.as_secs_f64()
                    * self.backoff_multiplier.powf(f64::from(attempt));
                if secs.is_finite() && secs >= 0.0 && secs < self.max_delay.as_secs_f64() {
                    Some(Duration::from_secs_f64(secs))
                } else {
                    None
                }
            }
        };
        raw.map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Whether a failure of `kind` on attempt `attempt` (zero-based) should
    /// be retried.
    pub fn should_retry(&self, kind: ErrorKind, attempt: u32) -> bool {
        if attempt >= self.max_retries {
            return false;
        }
        match kind {
            ErrorKind::Timeout => self.retry_on_timeout,
            ErrorKind::Connection => self.retry_on_connection_error,
            ErrorKind::Server => self.retry_on_server_error,
            ErrorKind::Client | ErrorKind::StreamProtocol | ErrorKind::Local => false,
        }
    }

    /// Run `op` until it succeeds, fails fatally, or the policy gives up.
    ///
    /// `op` receives the zero-based attempt number.  Between attempts the
    /// task sleeps for [`delay`](Self::delay) without blocking other tasks.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        self.run_with(op, |_, _, _| {}).await
    }

    /// Like [`run`](Self::run), calling `on_retry(retry, error, delay)`
    /// before each backoff sleep.  `retry` starts at 1.
    pub async fn run_with<T, F, Fut, R>(&self, mut op: F, mut on_retry: R) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T>>,
        R: FnMut(u32, &InferenceError, Duration),
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Attempt::Ok(value) => return Ok(value),
                Attempt::Fatal(err) => {
                    tracing::debug!(attempt, error = %err, "request failed, not retryable");
                    return Err(err);
                }
                Attempt::Retryable(err) => {
                    if !self.should_retry(err.kind(), attempt) {
                        tracing::warn!(
                            attempt,
                            max_retries = self.max_retries,
                            error = %err,
                            "giving up on request"
                        );
                        return Err(err);
                    }
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        retry = attempt + 1,
                        max_retries = self.max_retries,
                        delay = ?delay,
                        error = %err,
                        "request failed, retrying"
                    );
                    on_retry(attempt + 1, &err, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(strategy: RetryStrategy) -> RetryPolicy {
        RetryPolicy {
            strategy,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            ..RetryPolicy::default()
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_retries, 3);
        assert_eq!(p.base_delay, Duration::from_secs(1));
        assert_eq!(p.max_delay, Duration::from_secs(60));
        assert_eq!(p.strategy, RetryStrategy::ExponentialBackoff);
        assert!(p.retry_on_timeout && p.retry_on_connection_error && p.retry_on_server_error);
        assert_eq!(p.backoff_multiplier, 2.0);
    }

    #[test]
    fn exponential_delay_doubles_then_caps() {
        let p = policy(RetryStrategy::ExponentialBackoff);
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(2), Duration::from_millis(400));
        assert_eq!(p.delay(3), Duration::from_millis(800));
        assert_eq!(p.delay(4), Duration::from_secs(1));
        for n in 0..16 {
            let expected = (0.1 * 2f64.powi(n as i32)).min(1.0);
            assert!((p.delay(n).as_secs_f64() - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn linear_and_fixed_delays() {
        let linear = policy(RetryStrategy::LinearBackoff);
        assert_eq!(linear.delay(0), Duration::from_millis(100));
        assert_eq!(linear.delay(2), Duration::from_millis(300));
        assert_eq!(linear.delay(50), Duration::from_secs(1));

        let fixed = policy(RetryStrategy::FixedDelay);
        assert_eq!(fixed.delay(0), Duration::from_millis(100));
        assert_eq!(fixed.delay(9), Duration::from_millis(100));
    }

    #[test]
    fn delay_saturates_for_huge_attempts() {
        for strategy in [
            RetryStrategy::FixedDelay,
            RetryStrategy::LinearBackoff,
            RetryStrategy::ExponentialBackoff,
        ] {
            let p = RetryPolicy {
                strategy,
                base_delay: Duration::from_secs(u64::MAX / 2),
                max_delay: Duration::from_secs(30),
                ..RetryPolicy::default()
            };
            for attempt in [0, 1, 63, 1024, u32::MAX] {
                assert!(p.delay(attempt) <= p.max_delay);
            }
        }
    }

    #[test]
    fn should_retry_stops_at_max_retries() {
        let p = RetryPolicy::default();
        for kind in [ErrorKind::Timeout, ErrorKind::Connection, ErrorKind::Server] {
            assert!(p.should_retry(kind, 0));
            assert!(p.should_retry(kind, 2));
            assert!(!p.should_retry(kind, 3));
            assert!(!p.should_retry(kind, 100));
        }
    }

    #[test]
    fn client_errors_never_retried() {
        let p = RetryPolicy {
            max_retries: 10,
            ..RetryPolicy::default()
        };
        for attempt in 0..20 {
            assert!(!p.should_retry(ErrorKind::Client, attempt));
            assert!(!p.should_retry(ErrorKind::StreamProtocol, attempt));
        }
    }

    #[test]
    fn per_kind_flags_respected() {
        let p = RetryPolicy {
            retry_on_timeout: false,
            retry_on_server_error: false,
            ..RetryPolicy::default()
        };
        assert!(!p.should_retry(ErrorKind::Timeout, 0));
        assert!(!p.should_retry(ErrorKind::Server, 0));
        assert!(p.should_retry(ErrorKind::Connection, 0));
    }

    #[test]
    fn invalid_multiplier_rejected() {
        let p = RetryPolicy {
            backoff_multiplier: 0.5,
            ..RetryPolicy::default()
        };
        assert!(p.validate().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[test]
    fn attempt_tagging_by_kind() {
        let a: Attempt<()> = Attempt::from_result(Err(InferenceError::from_status(503, "")));
        assert!(matches!(a, Attempt::Retryable(_)));
        let a: Attempt<()> = Attempt::from_result(Err(InferenceError::from_status(400, "")));
        assert!(matches!(a, Attempt::Fatal(_)));
        let a = Attempt::from_result(Ok(7));
        assert!(matches!(a, Attempt::Ok(7)));
    }

    #[tokio::test]
    async fn run_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = fast()
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Attempt::Retryable(InferenceError::Connection {
                            reason: "refused".into(),
                        })
                    } else {
                        Attempt::Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Attempt::<()>::Retryable(InferenceError::Timeout {
                        reason: "slow".into(),
                    })
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Timeout { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn run_stops_on_fatal() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Attempt::<()>::Fatal(InferenceError::from_status(401, "no key")) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Client { status: 401, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_with_reports_each_retry() {
        let mut seen = Vec::new();
        let result = fast()
            .run_with(
                |attempt| async move {
                    if attempt < 2 {
                        Attempt::Retryable(InferenceError::from_status(503, "busy"))
                    } else {
                        Attempt::Ok(attempt)
                    }
                },
                |retry, err, delay| seen.push((retry, err.kind(), delay)),
            )
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(
            seen,
            vec![
                (1, ErrorKind::Server, Duration::from_millis(1)),
                (2, ErrorKind::Server, Duration::from_millis(2)),
            ]
        );
    }

    #[tokio::test]
    async fn run_with_skips_hook_when_not_retrying() {
        let mut hooks = 0;
        let err = fast()
            .run_with(
                |_| async { Attempt::<()>::Fatal(InferenceError::from_status(400, "bad")) },
                |_, _, _| hooks += 1,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Client { status: 400, .. }));
        assert_eq!(hooks, 0);
    }
}
