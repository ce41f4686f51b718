//! Retry Policy (C3): error classification plus exponential backoff with
//! jitter (§4.3).

use std::collections::HashMap;
use std::future::Future;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::time::Duration;

use regex::Regex;

use crate::error::ProviderError;

/// Classification of a provider-call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RateLimit,
    Timeout,
    ContextTooLarge,
    ModelOverloaded,
    NetworkError,
    AuthenticationError,
    Unknown,
}

impl ErrorKind {
    /// Authentication errors are never retryable; every other kind is.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::AuthenticationError)
    }
}

static RATE_LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)rate.?limit|too many requests|429").expect("valid regex"));
static TIMEOUT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)time.?out|deadline exceeded").expect("valid regex"));
static CONTEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)context.?length|context.?too.?large|maximum context|token limit")
        .expect("valid regex")
});
static OVERLOADED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)overloaded|server.?busy|503|529").expect("valid regex"));
static NETWORK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)connection reset|connection refused|network|dns|broken pipe")
        .expect("valid regex")
});
static AUTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)unauthorized|invalid api key|authentication|forbidden|401|403")
        .expect("valid regex")
});

impl ErrorKind {
    /// Classify an error by regex against its message (§4.3).
    #[must_use]
    pub fn classify(message: &str) -> Self {
        if AUTH_RE.is_match(message) {
            Self::AuthenticationError
        } else if RATE_LIMIT_RE.is_match(message) {
            Self::RateLimit
        } else if CONTEXT_RE.is_match(message) {
            Self::ContextTooLarge
        } else if OVERLOADED_RE.is_match(message) {
            Self::ModelOverloaded
        } else if TIMEOUT_RE.is_match(message) {
            Self::Timeout
        } else if NETWORK_RE.is_match(message) {
            Self::NetworkError
        } else {
            Self::Unknown
        }
    }
}

/// Backoff/attempt configuration (§4.3 defaults, overridable via env §6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fractional jitter: final delay varies by up to `± jitter * delay`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Build a config from `RAAF_PROVIDER_RETRY_*` environment overrides,
    /// falling back to spec defaults for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_attempts: env_u32("RAAF_PROVIDER_RETRY_ATTEMPTS").unwrap_or(default.max_attempts),
            base_delay: env_millis("RAAF_PROVIDER_RETRY_BASE_DELAY")
                .unwrap_or(default.base_delay),
            max_delay: env_millis("RAAF_PROVIDER_RETRY_MAX_DELAY").unwrap_or(default.max_delay),
            multiplier: env_f64("RAAF_PROVIDER_RETRY_MULTIPLIER").unwrap_or(default.multiplier),
            jitter: env_f64("RAAF_PROVIDER_RETRY_JITTER").unwrap_or(default.jitter),
        }
    }

    /// `delay = min(base * multiplier^(attempt-1), max_delay)`, jittered by
    /// a uniform factor in `±(jitter * delay)`. `attempt` is 1-based.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_ms = self.base_delay.as_secs_f64() * 1000.0;
        let scaled = base_ms * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64() * 1000.0);

        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            let offset = (fastrand::f64() * 2.0 - 1.0) * spread;
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(jittered.round() as u64)
    }
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_u32(key).map(|ms| Duration::from_millis(u64::from(ms)))
}

/// Mutex-protected retry counters (§4.3, §5 "Shared-resource policy").
#[derive(Debug, Default, Clone)]
pub struct RetryStatsSnapshot {
    pub total_attempts: u64,
    pub successful_retries: u64,
    pub failed_operations: u64,
    pub by_error_kind: HashMap<ErrorKind, u64>,
}

#[derive(Debug, Default)]
struct RetryStats {
    total_attempts: u64,
    successful_retries: u64,
    failed_operations: u64,
    by_error_kind: HashMap<ErrorKind, u64>,
}

/// An error raised by the operation a [`RetryPolicy`] is wrapping.
#[derive(Debug, Clone)]
pub struct RetryableError {
    pub message: String,
    /// Explicit classification override; if `None`, classified by message.
    pub kind: Option<ErrorKind>,
}

impl RetryableError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
        }
    }

    #[must_use]
    pub fn with_kind(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            message: message.into(),
            kind: Some(kind),
        }
    }

    #[must_use]
    pub fn classify(&self) -> ErrorKind {
        self.kind.unwrap_or_else(|| ErrorKind::classify(&self.message))
    }
}

/// Classifies errors, applies backoff, and owns per-instance retry
/// statistics. One instance lives on the provider adapter (§9: "retry stats
/// live on the provider adapter instance, not globally").
pub struct RetryPolicy {
    config: RetryConfig,
    stats: Mutex<RetryStats>,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(RetryStats::default()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> RetryStatsSnapshot {
        let stats = self.stats.lock().expect("retry stats mutex poisoned");
        RetryStatsSnapshot {
            total_attempts: stats.total_attempts,
            successful_retries: stats.successful_retries,
            failed_operations: stats.failed_operations,
            by_error_kind: stats.by_error_kind.clone(),
        }
    }

    /// Run `op`, retrying on classified-retryable failures with backoff,
    /// until success, a non-retryable failure, or `max_attempts` is reached.
    ///
    /// # Errors
    /// Returns [`ProviderError::RetriesExhausted`] once attempts are used up,
    /// or an immediate non-retryable error.
    pub async fn execute<F, Fut, T>(&self, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RetryableError>>,
    {
        let mut attempt = 0u32;
        let mut last_message = String::new();

        loop {
            attempt += 1;
            {
                let mut stats = self.stats.lock().expect("retry stats mutex poisoned");
                stats.total_attempts += 1;
            }

            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        let mut stats = self.stats.lock().expect("retry stats mutex poisoned");
                        stats.successful_retries += 1;
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let kind = err.classify();
                    last_message = err.message;
                    {
                        let mut stats = self.stats.lock().expect("retry stats mutex poisoned");
                        *stats.by_error_kind.entry(kind).or_insert(0) += 1;
                    }

                    if !kind.is_retryable() {
                        let mut stats = self.stats.lock().expect("retry stats mutex poisoned");
                        stats.failed_operations += 1;
                        return Err(ProviderError::Authentication(last_message));
                    }

                    if attempt >= self.config.max_attempts {
                        let mut stats = self.stats.lock().expect("retry stats mutex poisoned");
                        stats.failed_operations += 1;
                        return Err(ProviderError::RetriesExhausted {
                            attempts: attempt,
                            last_error: last_message,
                        });
                    }

                    let delay = self.config.delay_for_attempt(attempt);
                    tracing::warn!(attempt, ?kind, delay_ms = delay.as_millis() as u64, "retrying provider call");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limit() {
        assert_eq!(
            ErrorKind::classify("429 rate limit exceeded"),
            ErrorKind::RateLimit
        );
    }

    #[test]
    fn classifies_auth_as_non_retryable() {
        let kind = ErrorKind::classify("401 unauthorized: invalid api key");
        assert_eq!(kind, ErrorKind::AuthenticationError);
        assert!(!kind.is_retryable());
    }

    #[test]
    fn unclassified_messages_are_unknown_but_retryable() {
        let kind = ErrorKind::classify("something weird happened");
        assert_eq!(kind, ErrorKind::Unknown);
        assert!(kind.is_retryable());
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let config = RetryConfig {
            jitter: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        // attempt 10 would be 512s, capped to max_delay (60s).
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let policy = RetryPolicy::new(RetryConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryConfig::default()
        });
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = policy
            .execute(|| {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(RetryableError::new("timeout while waiting"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(policy.stats().successful_retries, 1);
    }

    #[tokio::test]
    async fn non_retryable_fails_on_first_occurrence() {
        let policy = RetryPolicy::new(RetryConfig::default());
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), _> = policy
            .execute(|| {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move { Err(RetryableError::with_kind("nope", ErrorKind::AuthenticationError)) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_exhausts_after_max_attempts() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..RetryConfig::default()
        });
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), _> = policy
            .execute(|| {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move { Err(RetryableError::new("connection reset by peer")) }
            })
            .await;
        assert!(matches!(result, Err(ProviderError::RetriesExhausted { attempts: 3, .. })));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
