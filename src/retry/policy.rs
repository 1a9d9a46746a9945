//! Bounded retry with a fixed delay and an optional expected result.

use std::{
    fmt, thread,
    time::{Duration, Instant},
};

use log::{error, warn};

use crate::error::{BoxError, RetryError};

/// Longest stretch slept between cancellation checks.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// How a flaky operation is retried.
///
/// An attempt succeeds when the operation returns `Ok`. Through
/// `retry_expecting`, the result rendered with `Display` and trimmed must
/// also equal `expected` when it is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub expected: Option<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(2),
            expected: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            expected: None,
        }
    }

    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    /// Invokes `operation` until it returns `Ok` or `max_attempts` runs out.
    ///
    /// Sleeps `delay` between attempts (not after the last one). With
    /// `max_attempts == 0` the operation is never called. `expected` is not
    /// consulted here; use `retry_expecting` for that.
    pub fn retry<T, E, F>(&self, operation: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Result<T, E>,
        E: Into<BoxError>,
    {
        self.attempts(operation, |_| None, || false)
    }

    /// Like `retry`, but an `Ok` result only counts once its trimmed
    /// `Display` output equals `expected` (when set).
    pub fn retry_expecting<T, E, F>(&self, operation: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Result<T, E>,
        T: fmt::Display,
        E: Into<BoxError>,
    {
        self.attempts(operation, |value| self.mismatch(value), || false)
    }

    /// Retries that give up as soon as `cancelled` returns true, checked before
    /// every attempt and while waiting between attempts.
    pub fn until_cancelled<C>(&self, cancelled: C) -> CancellableRetry<'_, C>
    where
        C: Fn() -> bool,
    {
        CancellableRetry {
            policy: self,
            cancelled,
        }
    }

    /// Turns `operation` into a closure that retries under this policy on every call.
    pub fn wrap<T, E, F>(&self, mut operation: F) -> impl FnMut() -> Result<T, RetryError>
    where
        F: FnMut() -> Result<T, E>,
        E: Into<BoxError>,
    {
        let policy = self.clone();
        move || policy.retry(&mut operation)
    }

    /// Trimmed rendering of `value` when it does not match `expected`.
    fn mismatch<T: fmt::Display>(&self, value: &T) -> Option<String> {
        let expected = self.expected.as_deref()?;
        let actual = value.to_string();
        let actual = actual.trim();
        (actual != expected).then(|| actual.to_string())
    }

    fn attempts<T, E, F, A, C>(&self, mut operation: F, mismatch: A, cancelled: C) -> Result<T, RetryError>
    where
        F: FnMut() -> Result<T, E>,
        E: Into<BoxError>,
        A: Fn(&T) -> Option<String>,
        C: Fn() -> bool,
    {
        if self.max_attempts == 0 {
            error!("Retry called with max_attempts = 0, operation not invoked.");
            return Err(RetryError::NoAttempts);
        }

        let mut attempt = 0;
        loop {
            if cancelled() {
                warn!("Retry cancelled after {} attempt(s).", attempt);
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            attempt += 1;

            let failure = match operation() {
                Ok(value) => match mismatch(&value) {
                    None => return Ok(value),
                    Some(actual) => {
                        let expected = self.expected.clone().unwrap_or_default();
                        warn!(
                            "Attempt {}/{}: got {:?}, expected {:?}.",
                            attempt, self.max_attempts, actual, expected
                        );
                        RetryError::Mismatch {
                            attempts: attempt,
                            actual,
                            expected,
                        }
                    }
                },
                Err(err) => {
                    let source: BoxError = err.into();
                    warn!("Attempt {}/{} failed: {}.", attempt, self.max_attempts, source);
                    RetryError::Failed {
                        attempts: attempt,
                        source,
                    }
                }
            };

            if attempt >= self.max_attempts {
                error!("{}", failure);
                return Err(failure);
            }
            self.pause(&cancelled);
        }
    }

    /// Sleeps `delay`, waking early once `cancelled` turns true.
    fn pause<C: Fn() -> bool>(&self, cancelled: &C) {
        let deadline = Instant::now() + self.delay;
        loop {
            let now = Instant::now();
            if now >= deadline || cancelled() {
                return;
            }
            thread::sleep((deadline - now).min(CANCEL_CHECK_INTERVAL));
        }
    }
}

/// A `RetryPolicy` bound to a cancellation check. See `RetryPolicy::until_cancelled`.
pub struct CancellableRetry<'a, C> {
    policy: &'a RetryPolicy,
    cancelled: C,
}

impl<C: Fn() -> bool> CancellableRetry<'_, C> {
    pub fn retry<T, E, F>(&self, operation: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Result<T, E>,
        E: Into<BoxError>,
    {
        self.policy.attempts(operation, |_| None, &self.cancelled)
    }

    pub fn retry_expecting<T, E, F>(&self, operation: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Result<T, E>,
        T: fmt::Display,
        E: Into<BoxError>,
    {
        self.policy
            .attempts(operation, |value| self.policy.mismatch(value), &self.cancelled)
    }
}
