//! Retry with exponential backoff for capture and analysis attempts.
//!
//! [`RetryPolicy::should_retry`] is a pure decision: given the 1-based attempt
//! that just failed and its [`ErrorClass`], it answers whether to try again
//! and after how long.  [`run_with_retry`] drives an async operation through
//! that policy, racing every attempt and every backoff sleep against an abort
//! signal so a shutdown never leaves [`RetryState`] half-updated.
//!
//! # Policy
//!
//! | Class        | Retried | Notes                                        |
//! |--------------|---------|----------------------------------------------|
//! | `network`    | yes     |                                              |
//! | `timeout`    | yes     |                                              |
//! | `rate_limit` | yes     | delay is at least the provider's retry-after |
//! | `auth`       | never   | fatal, surfaces immediately                  |
//! | `malformed`  | yes     |                                              |
//! | `unknown`    | yes     |                                              |

use std::future::Future;
use std::time::Duration;

use chrono::NaiveDateTime;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{AnalysisError, ErrorCategory};
use crate::schedule::RetrySettings;

/// Failure class reported by the capture/analysis collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Network,
    Timeout,
    RateLimit,
    Auth,
    Malformed,
    Unknown,
}

impl ErrorClass {
    pub const ALL: [Self; 6] = [
        Self::Network,
        Self::Timeout,
        Self::RateLimit,
        Self::Auth,
        Self::Malformed,
        Self::Unknown,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Auth => "auth",
            Self::Malformed => "malformed",
            Self::Unknown => "unknown",
        }
    }

    /// Fatal classes abort immediately and are never retried.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Auth)
    }

    #[must_use]
    pub const fn category(self) -> ErrorCategory {
        match self {
            Self::Network | Self::Timeout | Self::RateLimit | Self::Unknown => {
                ErrorCategory::RetryableTransient
            }
            Self::Auth => ErrorCategory::Fatal,
            Self::Malformed => ErrorCategory::DataQuality,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "network" => Ok(Self::Network),
            "timeout" => Ok(Self::Timeout),
            "rate_limit" | "ratelimit" => Ok(Self::RateLimit),
            "auth" => Ok(Self::Auth),
            "malformed" => Ok(Self::Malformed),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("unknown error class: {s}")),
        }
    }
}

/// Why a failed attempt will not be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The error class is never retried.
    Fatal,
    /// `max_attempts` has been reached.
    Exhausted,
}

/// Answer of [`RetryPolicy::should_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryDecision {
    pub retry: bool,
    /// Wait before the next attempt; zero when not retrying.
    pub delay: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopReason>,
}

impl RetryDecision {
    const fn stop(reason: StopReason) -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
            stop: Some(reason),
        }
    }
}

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Multiplier applied per additional attempt (>= 1.0).
    pub backoff_multiplier: f64,
    /// Ceiling applied before jitter.
    pub max_delay: Duration,
    /// Upper bound of the additive jitter as a fraction of the delay.
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::daytime()
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        backoff_multiplier: f64,
        max_delay: Duration,
        jitter_fraction: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff_multiplier: backoff_multiplier.max(1.0),
            max_delay,
            jitter_fraction: jitter_fraction.clamp(0.0, 0.1),
        }
    }

    /// Daytime cadence: 3 attempts, 5s base.
    #[must_use]
    pub fn daytime() -> Self {
        Self::from_settings(&RetrySettings::daytime())
    }

    /// Overnight cadence: 5 attempts, 10s base.
    #[must_use]
    pub fn nighttime() -> Self {
        Self::from_settings(&RetrySettings::nighttime())
    }

    #[must_use]
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_secs(settings.base_delay_secs),
            settings.backoff_multiplier,
            Duration::from_secs(settings.max_delay_secs),
            settings.jitter_fraction,
        )
    }

    /// Un-jittered delay after the given failed attempt (1-based).
    ///
    /// `base_delay * backoff_multiplier^(attempt-1)`, clamped to `max_delay`.
    #[must_use]
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        // 2^62 already exceeds any Duration we would sleep for
        let exp = attempt.saturating_sub(1).min(62) as i32;
        let delay_ms = (base_ms * self.backoff_multiplier.powi(exp)).min(max_ms);
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Decide whether to retry after `attempt` failed with `class`.
    #[must_use]
    pub fn should_retry(
        &self,
        attempt: u32,
        class: ErrorClass,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        self.should_retry_with_rng(&mut rand::rng(), attempt, class, retry_after)
    }

    /// [`should_retry`](Self::should_retry) with a caller-supplied jitter source.
    pub fn should_retry_with_rng<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        attempt: u32,
        class: ErrorClass,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        if class.is_fatal() {
            return RetryDecision::stop(StopReason::Fatal);
        }
        if attempt >= self.max_attempts {
            return RetryDecision::stop(StopReason::Exhausted);
        }

        let base = self.base_delay_for_attempt(attempt);
        let jitter = if self.jitter_fraction > 0.0 && !base.is_zero() {
            let span_ms = base.as_millis() as f64 * self.jitter_fraction;
            Duration::from_millis(rng.random_range(0.0..=span_ms) as u64)
        } else {
            Duration::ZERO
        };

        let mut delay = base + jitter;
        if class == ErrorClass::RateLimit {
            if let Some(after) = retry_after {
                delay = delay.max(after);
            }
        }

        RetryDecision {
            retry: true,
            delay,
            stop: None,
        }
    }
}

/// Mutable bookkeeping for one in-flight capture/analysis attempt chain.
///
/// Discarded after success or exhaustion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_class: Option<ErrorClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<NaiveDateTime>,
}

impl RetryState {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts: max_attempts.max(1),
            last_error_class: None,
            next_retry_at: None,
        }
    }

    /// Record a failed attempt and the decision taken for it.
    pub fn record_failure(&mut self, class: ErrorClass, decision: &RetryDecision, now: NaiveDateTime) {
        self.attempts = self.attempts.saturating_add(1).min(self.max_attempts);
        self.last_error_class = Some(class);
        self.next_retry_at = if decision.retry {
            chrono::Duration::from_std(decision.delay)
                .ok()
                .map(|delay| now + delay)
        } else {
            None
        };
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Terminal result of [`run_with_retry`].
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    /// The operation eventually succeeded.
    Succeeded { value: T, attempts: u32 },
    /// A non-retryable error surfaced.
    Fatal { error: AnalysisError, attempts: u32 },
    /// Every allowed attempt failed.
    Exhausted { error: AnalysisError, attempts: u32 },
    /// The abort signal fired; neither success nor a retryable failure.
    Aborted { attempts: u32 },
}

impl<T> AttemptOutcome<T> {
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. }
            | Self::Fatal { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Aborted { attempts } => *attempts,
        }
    }
}

/// Whether the abort flag is raised.
#[must_use]
pub fn abort_requested(abort: &watch::Receiver<bool>) -> bool {
    *abort.borrow()
}

/// Resolve once the abort flag becomes true (or its sender is dropped).
pub async fn wait_for_abort(abort: &mut watch::Receiver<bool>) {
    // A dropped sender can never raise the flag, so park forever.
    if abort.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Execute an async operation with retry, backoff and abort support.
///
/// Each retry attempt is logged with the attempt number, the delay applied
/// and the error class that triggered it.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    abort: &mut watch::Receiver<bool>,
    mut operation: F,
) -> AttemptOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AnalysisError>>,
{
    let mut attempt = 0u32;

    loop {
        if abort_requested(abort) {
            return AttemptOutcome::Aborted { attempts: attempt };
        }
        attempt += 1;

        let result = tokio::select! {
            biased;
            () = wait_for_abort(abort) => {
                debug!(attempt, "Attempt aborted in flight");
                return AttemptOutcome::Aborted { attempts: attempt - 1 };
            }
            result = operation(attempt) => result,
        };

        let error = match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, retries = attempt - 1, "Operation succeeded after retries");
                }
                return AttemptOutcome::Succeeded {
                    value,
                    attempts: attempt,
                };
            }
            Err(error) => error,
        };

        let decision = policy.should_retry(attempt, error.class, error.retry_after);
        match decision.stop {
            Some(StopReason::Fatal) => {
                warn!(attempt, error_class = %error.class, error = %error, "Fatal provider error, not retrying");
                return AttemptOutcome::Fatal {
                    error,
                    attempts: attempt,
                };
            }
            Some(StopReason::Exhausted) => {
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error_class = %error.class,
                    error = %error,
                    "Operation failed after all retry attempts"
                );
                return AttemptOutcome::Exhausted {
                    error,
                    attempts: attempt,
                };
            }
            None => {}
        }

        debug!(
            attempt,
            delay_ms = decision.delay.as_millis() as u64,
            error_class = %error.class,
            error = %error,
            "Retrying after failure"
        );

        tokio::select! {
            biased;
            () = wait_for_abort(abort) => {
                return AttemptOutcome::Aborted { attempts: attempt };
            }
            () = tokio::time::sleep(decision.delay) => {}
        }
    }
}
