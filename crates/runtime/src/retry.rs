//! Retry controller for failable async operations.
//!
//! [`run`] drives any operation under a [`RetryPolicy`]. Code that needs to
//! act between attempts (emit events, rebuild a prompt) can use the
//! underlying [`Attempts`] cursor directly.

use crate::{Error, Result};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Decides whether an error deserves another attempt.
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Pause before a retry, as a function of the zero-based retry index.
#[derive(Clone, Default)]
pub enum Delay {
    #[default]
    None,
    Fixed(Duration),
    /// `base * factor^retry`, capped at `max`.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
    },
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl Delay {
    pub fn custom(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    /// Delay before retry number `retry` (0 for the first retry).
    pub fn for_retry(&self, retry: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed(delay) => *delay,
            Self::Exponential { base, factor, max } => {
                let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
                let nanos = (base.as_nanos() as f64 * factor.max(1.0).powi(exponent)).round();
                if !nanos.is_finite() || nanos >= max.as_nanos() as f64 {
                    *max
                } else {
                    Duration::from_nanos(nanos.max(0.0) as u64)
                }
            }
            Self::Custom(f) => f(retry),
        }
    }
}

impl fmt::Debug for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Self::Exponential { base, factor, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("factor", factor)
                .field("max", max)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// How many times to try, how long to wait, and what to retry.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Delay,
    predicate: Option<RetryPredicate>,
    validation_feedback: bool,
}

impl RetryPolicy {
    /// A policy allowing `max_attempts` tries (at least one).
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: Delay::None,
            predicate: None,
            validation_feedback: false,
        }
    }

    /// Try exactly once.
    pub fn never() -> Self {
        Self::new(1)
    }

    pub fn with_delay(mut self, delay: Delay) -> Self {
        self.delay = delay;
        self
    }

    /// Replace the default predicate ([`Error::is_retryable`]).
    pub fn with_predicate(mut self, f: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(f));
        self
    }

    /// Feed parse/validation errors back into the next prompt.
    pub fn with_validation_feedback(mut self, enabled: bool) -> Self {
        self.validation_feedback = enabled;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> &Delay {
        &self.delay
    }

    pub fn validation_feedback(&self) -> bool {
        self.validation_feedback
    }

    pub fn is_retryable(&self, error: &Error) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(error),
            None => error.is_retryable(),
        }
    }

    /// Start counting attempts under this policy.
    pub fn attempts(&self) -> Attempts<'_> {
        Attempts {
            policy: self,
            attempt: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .field("custom_predicate", &self.predicate.is_some())
            .field("validation_feedback", &self.validation_feedback)
            .finish()
    }
}

/// What to do after a failed attempt.
#[derive(Debug)]
pub enum Verdict {
    /// Sleep for `delay`, then try again. `error` is the failure just seen.
    Retry { delay: Duration, error: Error },
    /// Stop and surface this error.
    Fail(Error),
}

/// Attempt cursor for one run of a policy.
#[derive(Debug)]
pub struct Attempts<'p> {
    policy: &'p RetryPolicy,
    attempt: u32,
}

impl Attempts<'_> {
    /// Begin the next attempt, returning its 1-based number.
    pub fn begin(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    /// The attempt in progress (0 before the first `begin`).
    pub fn current(&self) -> u32 {
        self.attempt
    }

    /// Judge the failure of the current attempt.
    ///
    /// Non-retryable errors are returned unchanged. Retryable errors on the
    /// last attempt are wrapped in [`Error::MaxRetriesExceeded`].
    pub fn judge(&self, error: Error) -> Verdict {
        if !self.policy.is_retryable(&error) {
            return Verdict::Fail(error);
        }
        if self.attempt >= self.policy.max_attempts {
            return Verdict::Fail(Error::MaxRetriesExceeded {
                attempts: self.attempt,
                last_error: Box::new(error),
            });
        }
        let delay = self.policy.delay.for_retry(self.attempt.saturating_sub(1));
        Verdict::Retry { delay, error }
    }
}

/// Run `operation` under `policy`.
///
/// The operation receives the 1-based attempt number.
pub async fn run<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = policy.attempts();
    loop {
        let attempt = attempts.begin();
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        match attempts.judge(error) {
            Verdict::Retry { delay, error } => {
                warn!(attempt, ?delay, error = %error, "attempt failed, retrying");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Verdict::Fail(error) => return Err(error),
        }
    }
}
