//! Classified retry with exponential backoff.
//!
//! A failing call is retried only when its error is transient: a rate limit,
//! a 5xx/overload response, a timeout, a refused or reset connection, or the
//! designated `TransientError` / `AgentError::Transient` types. Anything else
//! is fatal and comes back from the first attempt without any backoff.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::errors::{AgentError, RetryError};

/// Whether an error is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Fatal,
}

/// Errors that can say whether they are transient.
pub trait Classify {
    fn classify(&self) -> ErrorClass;
}

/// Designated transient error type for callers that want to force a retry.
#[derive(Debug, Clone, Error)]
#[error("transient: {0}")]
pub struct TransientError(pub String);

impl Classify for TransientError {
    fn classify(&self) -> ErrorClass {
        ErrorClass::Transient
    }
}

impl Classify for std::io::Error {
    fn classify(&self) -> ErrorClass {
        use std::io::ErrorKind;
        match self.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionAborted
            | ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock => ErrorClass::Transient,
            _ => classify_message(&self.to_string()),
        }
    }
}

impl Classify for anyhow::Error {
    fn classify(&self) -> ErrorClass {
        for cause in self.chain() {
            if cause.downcast_ref::<TransientError>().is_some() {
                return ErrorClass::Transient;
            }
            if let Some(io) = cause.downcast_ref::<std::io::Error>()
                && io.classify() == ErrorClass::Transient
            {
                return ErrorClass::Transient;
            }
        }
        classify_message(&format!("{:#}", self))
    }
}

impl Classify for AgentError {
    fn classify(&self) -> ErrorClass {
        match self {
            AgentError::Transient(_) => ErrorClass::Transient,
            AgentError::Fatal(_) => ErrorClass::Fatal,
            AgentError::Other(e) => e.classify(),
        }
    }
}

impl Classify for String {
    fn classify(&self) -> ErrorClass {
        classify_message(self)
    }
}

const TRANSIENT_PHRASES: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "overloaded",
    "internal server error",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "connection aborted",
    "temporarily unavailable",
];

const TRANSIENT_STATUS_CODES: &[&str] = &["429", "500", "502", "503", "504", "529"];

/// Classify an error by its message signature.
///
/// Status codes only count as whole tokens, so "5000 tokens" is not a 500.
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();

    if TRANSIENT_PHRASES.iter().any(|p| lower.contains(p)) {
        return ErrorClass::Transient;
    }

    let has_status = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| TRANSIENT_STATUS_CODES.contains(&token));

    if has_status {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

/// Backoff policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first; 0 is treated as 1
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    /// Spread each delay uniformly over ±25%
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// `min(initial_delay * base^attempt, max_delay)`, before jitter.
    ///
    /// `attempt` is zero-based: the delay after the first failure uses 0.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();

        if !secs.is_finite() || secs >= max_secs {
            self.max_delay
        } else if secs <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay to sleep after failed attempt `attempt`, jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
        base.mul_f64(factor)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// What a retried call cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub attempts: u32,
    pub total_backoff: Duration,
}

/// Wraps one fallible async call with classified retry.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `op` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `op` receives the zero-based attempt number.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, RetryError<E>>
    where
        E: Classify + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with_stats(op).await.0
    }

    /// Same as `call`, also reporting attempts made and time spent in backoff.
    pub async fn call_with_stats<T, E, F, Fut>(
        &self,
        mut op: F,
    ) -> (Result<T, RetryError<E>>, RetryStats)
    where
        E: Classify + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.config.attempts();
        let mut stats = RetryStats::default();
        let mut attempt = 0;

        loop {
            stats.attempts += 1;
            let err = match op(attempt).await {
                Ok(value) => return (Ok(value), stats),
                Err(err) => err,
            };

            if err.classify() == ErrorClass::Fatal {
                debug!(attempt, error = %err, "fatal error, not retrying");
                return (Err(RetryError::Fatal(err)), stats);
            }

            if stats.attempts >= max_attempts {
                warn!(attempts = stats.attempts, error = %err, "retry budget exhausted");
                return (
                    Err(RetryError::Exhausted {
                        attempts: stats.attempts,
                        last_error: err,
                    }),
                    stats,
                );
            }

            let delay = self.config.delay_for_attempt(attempt);
            debug!(attempt, ?delay, error = %err, "transient error, backing off");
            tokio::time::sleep(delay).await;
            stats.total_backoff += delay;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::default()
                .with_delays(Duration::from_millis(1), Duration::from_millis(5))
                .with_jitter(false),
        )
    }

    #[test]
    fn test_classify_message_signatures() {
        assert_eq!(classify_message("HTTP 429 Too Many Requests"), ErrorClass::Transient);
        assert_eq!(classify_message("upstream returned 503"), ErrorClass::Transient);
        assert_eq!(classify_message("model is overloaded"), ErrorClass::Transient);
        assert_eq!(classify_message("request timed out"), ErrorClass::Transient);
        assert_eq!(classify_message("Connection refused (os error 111)"), ErrorClass::Transient);
        assert_eq!(classify_message("invalid API key"), ErrorClass::Fatal);
        assert_eq!(classify_message("prompt exceeds 5000 tokens"), ErrorClass::Fatal);
    }

    #[test]
    fn test_classify_agent_error() {
        assert_eq!(AgentError::Transient("x".into()).classify(), ErrorClass::Transient);
        assert_eq!(AgentError::Fatal("503".into()).classify(), ErrorClass::Fatal);
        let other = AgentError::Other(anyhow::anyhow!("rate limit hit"));
        assert_eq!(other.classify(), ErrorClass::Transient);
        let wrapped = AgentError::Other(anyhow::Error::new(TransientError("flaky".into())));
        assert_eq!(wrapped.classify(), ErrorClass::Transient);
    }

    #[test]
    fn test_classify_io_error_kinds() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(reset.classify(), ErrorClass::Transient);
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        assert_eq!(missing.classify(), ErrorClass::Fatal);
    }

    #[test]
    fn test_base_delay_grows_and_caps() {
        let config = RetryConfig::default()
            .with_delays(Duration::from_millis(100), Duration::from_millis(500))
            .with_jitter(false);
        assert_eq!(config.base_delay(0), Duration::from_millis(100));
        assert_eq!(config.base_delay(1), Duration::from_millis(200));
        assert_eq!(config.base_delay(2), Duration::from_millis(400));
        assert_eq!(config.base_delay(3), Duration::from_millis(500));
        assert_eq!(config.base_delay(200), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let config = RetryConfig::default()
            .with_delays(Duration::from_millis(1000), Duration::from_secs(60))
            .with_jitter(true);
        for _ in 0..100 {
            let d = config.delay_for_attempt(0);
            assert!(d >= Duration::from_millis(750), "{:?}", d);
            assert!(d <= Duration::from_millis(1250), "{:?}", d);
        }
    }

    #[tokio::test]
    async fn test_two_transient_failures_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let (result, stats) = fast()
            .call_with_stats(|_attempt| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(AgentError::Transient("503".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.attempts, 3);
        assert!(stats.total_backoff > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_fatal_error_returns_on_first_attempt_without_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let (result, stats) = fast()
            .call_with_stats(|_attempt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(AgentError::Fatal("invalid request".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Fatal(AgentError::Fatal(_)))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.total_backoff, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_exhaustion_wraps_last_error() {
        let (result, stats) = fast()
            .call_with_stats(|attempt| async move {
                Err::<(), _>(format!("connection reset on attempt {}", attempt))
            })
            .await;

        match result {
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "connection reset on attempt 2");
            }
            other => panic!("Expected Exhausted, got {:?}", other),
        }
        assert_eq!(stats.attempts, 3);
    }

    #[tokio::test]
    async fn test_zero_max_attempts_still_calls_once() {
        let executor = RetryExecutor::new(RetryConfig::default().with_max_attempts(0));
        let result: Result<u32, RetryError<String>> =
            executor.call(|_| async { Ok::<_, String>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
