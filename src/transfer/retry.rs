//! Retry engine with exponential backoff for transient transfer failures.
//!
//! This module provides the [`Retryer`], its [`RetryPolicy`], and the
//! [`Classify`] trait that errors implement so the engine can tell a failure
//! worth retrying from one that never will succeed.
//!
//! # Overview
//!
//! Each failed attempt is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - network resets, timeouts, 5xx responses
//! - [`FailureType::RateLimited`] - server throttling, retried with backoff
//!   (or the server's Retry-After hint when one is available)
//! - [`FailureType::Permanent`] - missing objects, bad input, local I/O setup
//! - [`FailureType::NeedsAuth`] - rejected credentials, never retried
//! - [`FailureType::Cancelled`] - the caller asked us to stop
//!
//! Errors with a typed category report it through [`Classify::failure_type`].
//! Opaque errors from third-party backends return `None` there and fall back
//! to a message vocabulary (see [`classify_message`]).
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use transfer_core::transfer::{RetryPolicy, Retryer};
//!
//! # async fn example() {
//! let retryer = Retryer::new(
//!     RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(1), 2.0),
//! );
//! let cancel = CancellationToken::new();
//!
//! let value = retryer
//!     .run(&cancel, "stat", |attempt| async move {
//!         if attempt.number < 2 {
//!             Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
//!         } else {
//!             Ok(attempt.number)
//!         }
//!     })
//!     .await;
//! assert_eq!(value.unwrap(), 2);
//! # }
//! ```

use std::future::Future;
use std::io;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::constants::MAX_RETRY_AFTER;
use super::error::{RetryError, TransferCancelled};

/// Default maximum attempts (including the first one).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry.
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Jitter adds up to this fraction of the base delay.
const MAX_JITTER_FRACTION: f64 = 0.25;

/// Messages that mark a failure as permanent.
const PERMANENT_MARKERS: &[&str] = &["not found", "invalid argument", "permission denied"];

/// Messages that mark a failure as transient.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timeout",
    "network unreachable",
    "network is unreachable",
    "no such host",
    "temporary failure",
    "tls handshake timeout",
    "i/o timeout",
    "timed out",
    "timeout",
    "broken pipe",
    "unexpected eof",
    "500 internal server error",
    "502 bad gateway",
    "503 service unavailable",
    "504 gateway timeout",
];

/// Messages that mark a failure as server-side throttling.
const RATE_LIMIT_MARKERS: &[&str] = &["429 too many requests", "too many requests"];

/// Throttling and transient error codes reported by the big object stores.
///
/// Always checked by [`classify_message`]; [`RetryPolicy::with_retryable_markers`]
/// adds to them.
pub const PROVIDER_RETRYABLE_MARKERS: &[&str] = &[
    "RequestTimeout",
    "ServiceUnavailable",
    "InternalError",
    "SlowDown",
    "ThrottlingException",
    "RequestLimitExceeded",
    "ProvisionedThroughputExceededException",
    "TransactionInProgressException",
    "TooManyRequests",
    "ServerBusy",
    "OperationTimedOut",
];

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    Transient,

    /// Permanent failure that won't succeed regardless of retries.
    Permanent,

    /// Credentials missing or rejected.
    NeedsAuth,

    /// Server rate limiting (HTTP 429, provider throttling).
    RateLimited,

    /// The caller cancelled the operation.
    Cancelled,
}

impl FailureType {
    /// Returns true for failure types the retry loop re-attempts.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited)
    }
}

/// Lets an error tell the [`Retryer`] how to treat it.
pub trait Classify {
    /// Typed category of the failure, or `None` when only the message is known.
    fn failure_type(&self) -> Option<FailureType>;

    /// Server-provided delay before the next attempt (Retry-After).
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Classify for io::Error {
    fn failure_type(&self) -> Option<FailureType> {
        if TransferCancelled::is_in_io(self) {
            return Some(FailureType::Cancelled);
        }

        match self.kind() {
            io::ErrorKind::NotFound
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::AlreadyExists
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::InvalidData
            | io::ErrorKind::Unsupported => Some(FailureType::Permanent),
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock => Some(FailureType::Transient),
            _ => None,
        }
    }
}

/// Classifies an error message using the fallback vocabulary.
///
/// Order: provider codes and `extra_markers` (retryable), then permanent
/// words, then rate-limit and transient words. Anything unrecognised is
/// permanent. Matching ignores case.
#[must_use]
pub fn classify_message(message: &str, extra_markers: &[String]) -> FailureType {
    let lowered = message.to_lowercase();
    let matches = |marker: &str| !marker.is_empty() && lowered.contains(&marker.to_lowercase());

    if PROVIDER_RETRYABLE_MARKERS.iter().any(|m| matches(m))
        || extra_markers.iter().any(|m| matches(m))
    {
        return FailureType::Transient;
    }

    if PERMANENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return FailureType::Permanent;
    }
    if RATE_LIMIT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return FailureType::RateLimited;
    }
    if TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return FailureType::Transient;
    }

    FailureType::Permanent
}

/// Classifies an HTTP status code into a failure type.
#[allow(clippy::match_same_arms)]
#[must_use]
pub fn classify_http_status(status: u16) -> FailureType {
    match status {
        400 => FailureType::Permanent,   // Bad Request
        401 => FailureType::NeedsAuth,   // Unauthorized
        403 => FailureType::NeedsAuth,   // Forbidden
        404 => FailureType::Permanent,   // Not Found
        408 => FailureType::Transient,   // Request Timeout
        409 => FailureType::Transient,   // Conflict (concurrent writer)
        410 => FailureType::Permanent,   // Gone
        429 => FailureType::RateLimited, // Too Many Requests
        500 => FailureType::Transient,   // Internal Server Error
        502 => FailureType::Transient,   // Bad Gateway
        503 => FailureType::RateLimited, // Service Unavailable (throttled)
        504 => FailureType::Transient,   // Gateway Timeout
        status if (400..500).contains(&status) => FailureType::Permanent,
        status if (500..600).contains(&status) => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

/// Parses a Retry-After header value (integer seconds or HTTP-date).
///
/// Values above one hour are capped; past dates and negative values yield `None`.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let seconds = u64::try_from(seconds).ok()?;
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    let datetime = httpdate::parse_http_date(header_value).ok()?;
    let delay = datetime.duration_since(std::time::SystemTime::now()).ok()?;
    Some(delay.min(MAX_RETRY_AFTER))
}

/// Backoff configuration for a [`Retryer`].
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `initial_delay`: 1 second
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0
/// - `jitter`: enabled
/// - `retryable_markers`: none beyond [`PROVIDER_RETRYABLE_MARKERS`]
///
/// # Delay Calculation
///
/// ```text
/// base  = min(max_delay, initial_delay * multiplier^(attempt - 1))
/// delay = base                        (jitter off)
/// delay = uniform[base, base * 1.25]  (jitter on)
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
    retryable_markers: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: true,
            retryable_markers: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy, replacing invalid values with defaults.
    ///
    /// Zero attempts or delays fall back to the defaults, a multiplier below
    /// 1.0 (or NaN) becomes 2.0, and `max_delay` is raised to `initial_delay`
    /// when it is smaller.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    ) -> Self {
        let defaults = Self::default();
        let max_attempts = if max_attempts == 0 {
            defaults.max_attempts
        } else {
            max_attempts
        };
        let initial_delay = if initial_delay.is_zero() {
            defaults.initial_delay
        } else {
            initial_delay
        };
        let max_delay = if max_delay.is_zero() {
            defaults.max_delay
        } else {
            max_delay
        }
        .max(initial_delay);
        let multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
            multiplier
        } else {
            defaults.multiplier
        };

        Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier,
            ..defaults
        }
    }

    /// Creates a policy with a custom `max_attempts`, using defaults for other settings.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        let defaults = Self::default();
        Self::new(
            max_attempts,
            defaults.initial_delay,
            defaults.max_delay,
            defaults.multiplier,
        )
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Adds retryable message markers on top of [`PROVIDER_RETRYABLE_MARKERS`].
    ///
    /// Empty markers and case-insensitive duplicates are skipped.
    #[must_use]
    pub fn with_retryable_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for marker in markers {
            let marker = marker.into();
            let known = self
                .retryable_markers
                .iter()
                .any(|m| m.eq_ignore_ascii_case(&marker));
            if !marker.is_empty() && !known {
                self.retryable_markers.push(marker);
            }
        }
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    #[must_use]
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    #[must_use]
    pub fn jitter(&self) -> bool {
        self.jitter
    }

    #[must_use]
    pub fn retryable_markers(&self) -> &[String] {
        &self.retryable_markers
    }

    /// Delay to sleep after `attempt` (1-indexed) failed.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let initial_nanos = self.initial_delay.as_nanos() as f64;
        let max_nanos = self.max_delay.as_nanos() as f64;

        // inf from a huge exponent collapses to max_nanos here
        let base_nanos = (initial_nanos * self.multiplier.powi(exponent)).min(max_nanos);
        let base = Duration::from_nanos(base_nanos as u64);

        if !self.jitter {
            return base;
        }

        let fraction = rand::thread_rng().gen_range(0.0..=MAX_JITTER_FRACTION);
        base + base.mul_f64(fraction)
    }
}

/// The attempt currently running, handed to each invocation of the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt ordinal.
    pub number: u32,
    /// Configured maximum attempts.
    pub max_attempts: u32,
}

impl Attempt {
    /// Returns true for the first attempt.
    #[must_use]
    pub fn is_first(self) -> bool {
        self.number == 1
    }

    /// Returns true when no further attempt follows this one.
    #[must_use]
    pub fn is_last(self) -> bool {
        self.number >= self.max_attempts
    }
}

/// Runs fallible async operations under a [`RetryPolicy`].
///
/// A `Retryer` holds no per-call state and can be shared across tasks behind
/// an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct Retryer {
    policy: RetryPolicy,
}

impl Retryer {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Classifies an error: typed category first, message vocabulary second.
    pub fn classify<E>(&self, error: &E) -> FailureType
    where
        E: Classify + std::error::Error,
    {
        if let Some(kind) = error.failure_type() {
            return kind;
        }
        classify_message(&error_chain_text(error), &self.policy.retryable_markers)
    }

    /// Runs `op` until it succeeds, fails permanently, exhausts the policy,
    /// or `cancel` fires.
    ///
    /// `operation` labels log lines and the exhaustion error. Permanent
    /// failures come back as [`RetryError::Permanent`] holding the original
    /// error.
    ///
    /// # Errors
    ///
    /// See [`RetryError`].
    #[instrument(skip(self, cancel, op), fields(max_attempts = self.policy.max_attempts))]
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::error::Error,
    {
        let max_attempts = self.policy.max_attempts;
        let mut number = 1;

        loop {
            if cancel.is_cancelled() {
                debug!(operation, attempt = number, "cancelled before attempt");
                return Err(RetryError::Cancelled {
                    operation: operation.to_string(),
                });
            }

            let attempt = Attempt {
                number,
                max_attempts,
            };

            let error = match op(attempt).await {
                Ok(value) => {
                    if number > 1 {
                        info!(operation, attempts = number, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let failure = self.classify(&error);
            match failure {
                FailureType::Cancelled => {
                    debug!(operation, attempt = number, "operation cancelled");
                    return Err(RetryError::Cancelled {
                        operation: operation.to_string(),
                    });
                }
                FailureType::Permanent | FailureType::NeedsAuth => {
                    warn!(
                        operation,
                        attempt = number,
                        ?failure,
                        error = %error,
                        "non-retryable failure"
                    );
                    return Err(RetryError::Permanent(error));
                }
                FailureType::Transient | FailureType::RateLimited => {}
            }

            if number >= max_attempts {
                error!(
                    operation,
                    attempts = number,
                    error = %error,
                    "retries exhausted"
                );
                return Err(RetryError::Exhausted {
                    operation: operation.to_string(),
                    attempts: number,
                    source: error,
                });
            }

            let delay = error.retry_after().map_or_else(
                || self.policy.calculate_delay(number),
                |hint| hint.min(MAX_RETRY_AFTER),
            );

            warn!(
                operation,
                attempt = number,
                max_attempts,
                ?failure,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "attempt failed, retrying"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(operation, attempt = number, "cancelled during backoff");
                    return Err(RetryError::Cancelled {
                        operation: operation.to_string(),
                    });
                }
                () = tokio::time::sleep(delay) => {}
            }

            number += 1;
        }
    }
}

/// Joins an error and its sources into one message for vocabulary matching.
fn error_chain_text(error: &dyn std::error::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    /// Error with a fixed message and optional typed category.
    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError {
        message: String,
        kind: Option<FailureType>,
        retry_after: Option<Duration>,
    }

    impl TestError {
        fn opaque(message: &str) -> Self {
            Self {
                message: message.to_string(),
                kind: None,
                retry_after: None,
            }
        }

        fn typed(kind: FailureType) -> Self {
            Self {
                message: format!("{kind:?}"),
                kind: Some(kind),
                retry_after: None,
            }
        }
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(&self.message)
        }
    }

    impl std::error::Error for TestError {}

    impl Classify for TestError {
        fn failure_type(&self) -> Option<FailureType> {
            self.kind
        }

        fn retry_after(&self) -> Option<Duration> {
            self.retry_after
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(100),
            Duration::from_secs(10),
            2.0,
        )
        .with_jitter(false)
    }

    // ==================== RetryPolicy Tests ====================

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.initial_delay(), Duration::from_secs(1));
        assert_eq!(policy.max_delay(), Duration::from_secs(30));
        assert!((policy.multiplier() - 2.0).abs() < f64::EPSILON);
        assert!(policy.jitter());
        assert!(policy.retryable_markers().is_empty());
    }

    #[test]
    fn test_retry_policy_invalid_values_replaced_with_defaults() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO, 0.5);
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.initial_delay(), Duration::from_secs(1));
        assert_eq!(policy.max_delay(), Duration::from_secs(30));
        assert!((policy.multiplier() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_retry_policy_nan_multiplier_replaced() {
        let policy = RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(5), f64::NAN);
        assert!((policy.multiplier() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_retry_policy_max_delay_raised_to_initial_delay() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(1), 2.0);
        assert_eq!(policy.max_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_policy_with_max_attempts() {
        let policy = RetryPolicy::with_max_attempts(7);
        assert_eq!(policy.max_attempts(), 7);
        assert_eq!(policy.initial_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_policy_with_retryable_markers_appends() {
        let policy = RetryPolicy::default()
            .with_retryable_markers(["QuotaBurst"])
            .with_retryable_markers(["quotaburst", "", "NodeBusy"]);
        assert_eq!(
            policy.retryable_markers(),
            ["QuotaBurst".to_string(), "NodeBusy".to_string()]
        );
    }

    // ==================== Delay Calculation Tests ====================

    #[test]
    fn test_delay_without_jitter_is_exact_geometric_sequence() {
        let policy = fast_policy(10);
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(400));
        assert_eq!(policy.calculate_delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_without_jitter_is_repeatable() {
        let policy = fast_policy(10);
        for attempt in 1..=6 {
            assert_eq!(policy.calculate_delay(attempt), policy.calculate_delay(attempt));
        }
    }

    #[test]
    fn test_delay_capped_at_max_delay() {
        let policy =
            RetryPolicy::new(20, Duration::from_secs(1), Duration::from_secs(30), 2.0).with_jitter(false);
        assert_eq!(policy.calculate_delay(5), Duration::from_secs(16));
        assert_eq!(policy.calculate_delay(6), Duration::from_secs(30));
        assert_eq!(policy.calculate_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_multiplier_one_is_constant() {
        let policy =
            RetryPolicy::new(5, Duration::from_millis(250), Duration::from_secs(5), 1.0).with_jitter(false);
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(250));
        assert_eq!(policy.calculate_delay(4), Duration::from_millis(250));
    }

    #[test]
    fn test_delay_with_jitter_within_quarter_band_and_varies() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(30), 2.0);
        let base = Duration::from_secs(2);
        let upper = base.mul_f64(1.25);

        let samples: Vec<Duration> = (0..50).map(|_| policy.calculate_delay(2)).collect();
        for delay in &samples {
            assert!(*delay >= base, "delay {delay:?} below base");
            assert!(*delay <= upper, "delay {delay:?} above base * 1.25");
        }
        assert!(samples.iter().any(|d| *d != samples[0]));
    }

    // ==================== Classification Tests ====================

    #[test]
    fn test_classify_message_permanent_vocabulary() {
        assert_eq!(classify_message("object not found", &[]), FailureType::Permanent);
        assert_eq!(
            classify_message("invalid argument: bucket", &[]),
            FailureType::Permanent
        );
        assert_eq!(
            classify_message("Permission denied (publickey)", &[]),
            FailureType::Permanent
        );
    }

    #[test]
    fn test_classify_message_transient_vocabulary() {
        for message in [
            "dial tcp: connection refused",
            "read: connection reset by peer",
            "network unreachable",
            "i/o timeout",
            "write: broken pipe",
            "Server returned non-2XX status code: 503 Service Unavailable",
            "Server returned non-2XX status code: 500 Internal Server Error",
        ] {
            assert!(
                classify_message(message, &[]).is_retryable(),
                "expected retryable: {message}"
            );
        }
    }

    #[test]
    fn test_classify_message_rate_limited() {
        assert_eq!(
            classify_message("HTTP 429 Too Many Requests", &[]),
            FailureType::RateLimited
        );
    }

    #[test]
    fn test_classify_message_unknown_is_permanent() {
        assert_eq!(classify_message("checksum mismatch", &[]), FailureType::Permanent);
    }

    #[test]
    fn test_classify_message_custom_marker_is_retryable() {
        let markers = vec!["QuotaBurst".to_string()];
        assert_eq!(
            classify_message("upload rejected: QuotaBurst", &markers),
            FailureType::Transient
        );
        assert_eq!(
            classify_message("upload rejected: QuotaBurst", &[]),
            FailureType::Permanent
        );
    }

    #[test]
    fn test_classify_message_provider_codes_survive_custom_markers() {
        let markers = vec!["QuotaBurst".to_string()];
        assert_eq!(
            classify_message("ThrottlingException: Rate exceeded", &markers),
            FailureType::Transient
        );
        assert_eq!(
            classify_message("RequestTimeout: idle connection", &markers),
            FailureType::Transient
        );
    }

    #[test]
    fn test_classify_message_markers_ignore_case() {
        assert_eq!(
            classify_message("server said slowdown, please", &[]),
            FailureType::Transient
        );
        let markers = vec!["QuotaBurst".to_string()];
        assert_eq!(
            classify_message("QUOTABURST on bucket", &markers),
            FailureType::Transient
        );
    }

    #[test]
    fn test_classify_io_error_kinds() {
        let err = io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(err.failure_type(), Some(FailureType::Permanent));

        let err = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(err.failure_type(), Some(FailureType::Transient));

        let err = TransferCancelled.into_io();
        assert_eq!(err.failure_type(), Some(FailureType::Cancelled));

        let err = io::Error::other("something odd");
        assert_eq!(err.failure_type(), None);
    }

    #[test]
    fn test_classify_http_status_table() {
        assert_eq!(classify_http_status(404), FailureType::Permanent);
        assert_eq!(classify_http_status(401), FailureType::NeedsAuth);
        assert_eq!(classify_http_status(403), FailureType::NeedsAuth);
        assert_eq!(classify_http_status(429), FailureType::RateLimited);
        assert_eq!(classify_http_status(503), FailureType::RateLimited);
        assert_eq!(classify_http_status(500), FailureType::Transient);
        assert_eq!(classify_http_status(418), FailureType::Permanent);
        assert_eq!(classify_http_status(599), FailureType::Transient);
    }

    #[test]
    fn test_retryer_classify_uses_error_chain() {
        let inner = io::Error::other("upstream: connection reset by peer");
        let outer = io::Error::other(inner);
        let retryer = Retryer::default();
        assert_eq!(retryer.classify(&outer), FailureType::Transient);
    }

    // ==================== Retry-After Tests ====================

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("-5"), None);
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_parse_retry_after_capped_at_one_hour() {
        assert_eq!(parse_retry_after("86400"), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_parse_retry_after_past_http_date_is_none() {
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    // ==================== Retryer Tests ====================

    #[tokio::test]
    async fn test_run_success_first_attempt_calls_once() {
        let retryer = Retryer::new(fast_policy(5));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<&str, RetryError<TestError>> = retryer
            .run(&cancel, "stat", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok("done") }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_transient_twice_then_success_sleeps_backoff() {
        tokio::time::pause();
        let retryer = Retryer::new(fast_policy(3));
        let cancel = CancellationToken::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let start = Instant::now();

        let result = retryer
            .run(&cancel, "upload", |attempt| {
                seen.lock().unwrap().push(attempt.number);
                async move {
                    if attempt.number < 3 {
                        Err(TestError::opaque("connection reset by peer"))
                    } else {
                        Ok(attempt.number)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        // 100ms + 200ms
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_run_permanent_error_returns_original_without_sleep() {
        tokio::time::pause();
        let retryer = Retryer::new(fast_policy(5));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<(), _> = retryer
            .run(&cancel, "download", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::opaque("object not found")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        match result.unwrap_err() {
            RetryError::Permanent(error) => {
                assert_eq!(error, TestError::opaque("object not found"));
            }
            other => panic!("expected permanent error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_typed_needs_auth_is_not_retried() {
        let retryer = Retryer::new(fast_policy(5));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retryer
            .run(&cancel, "list", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::typed(FailureType::NeedsAuth)) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_exhausted_reports_attempt_count() {
        tokio::time::pause();
        let retryer = Retryer::new(fast_policy(3));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retryer
            .run(&cancel, "upload disk.vmdk", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::opaque("i/o timeout")) }
            })
            .await;

        let error = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(error.attempts(), Some(3));
        assert!(error.to_string().contains("failed after 3 attempts"));
        assert!(error.to_string().contains("i/o timeout"));
    }

    #[tokio::test]
    async fn test_run_single_attempt_policy_exhausts_immediately() {
        let retryer = Retryer::new(fast_policy(1));
        let cancel = CancellationToken::new();

        let result: Result<(), _> = retryer
            .run(&cancel, "stat", |_| async {
                Err(TestError::typed(FailureType::Transient))
            })
            .await;

        assert_eq!(result.unwrap_err().attempts(), Some(1));
    }

    #[tokio::test]
    async fn test_run_cancel_during_backoff_returns_before_delay() {
        tokio::time::pause();
        let policy = RetryPolicy::new(3, Duration::from_secs(60), Duration::from_secs(60), 2.0)
            .with_jitter(false);
        let retryer = Retryer::new(policy);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result: Result<(), _> = retryer
            .run(&cancel, "upload", |_| async {
                Err(TestError::typed(FailureType::Transient))
            })
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_run_already_cancelled_makes_no_attempt() {
        let retryer = Retryer::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let result: Result<(), RetryError<TestError>> = retryer
            .run(&cancel, "stat", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_cancelled_error_from_operation_not_retried() {
        let retryer = Retryer::new(fast_policy(5));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retryer
            .run(&cancel, "download", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TransferCancelled.into_io()) }
            })
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_honours_retry_after_hint() {
        tokio::time::pause();
        let retryer = Retryer::new(fast_policy(2));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let result = retryer
            .run(&cancel, "upload", |attempt| async move {
                if attempt.is_first() {
                    Err(TestError {
                        message: "429 Too Many Requests".to_string(),
                        kind: Some(FailureType::RateLimited),
                        retry_after: Some(Duration::from_secs(7)),
                    })
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        assert!(start.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_run_shared_retryer_keeps_attempts_per_call() {
        let retryer = Arc::new(Retryer::new(
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5), 2.0)
                .with_jitter(false),
        ));
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let retryer = Arc::clone(&retryer);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                retryer
                    .run(&cancel, "parallel", |attempt| async move {
                        if attempt.number < 2 {
                            Err(TestError::typed(FailureType::Transient))
                        } else {
                            Ok(attempt.number)
                        }
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 2);
        }
    }
}
