use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::store::{ClinicStore, Committed, StoreError, Transaction, UnitScope};

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    backoff_multiplier: u32,
}

impl RetryPolicy {
    /// Defaults: 3 attempts, 25ms initial delay, doubling.
    pub const fn new() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(25),
            backoff_multiplier: 2,
        }
    }

    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub const fn max_attempts(&self) -> u32 {
        if self.max_attempts == 0 {
            1
        } else {
            self.max_attempts
        }
    }

    /// Delay after the failed attempt with the given 0-based index.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.initial_delay * self.backoff_multiplier.saturating_pow(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error(transparent)]
    Aborted(E),
}

/// Errors that may succeed if the operation is simply run again.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        self.is_contention()
    }
}

pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
    is_transient: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts();
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !is_transient(&e) => return Err(RetryError::Aborted(e)),
            Err(e) => {
                attempt += 1;
                if attempt >= attempts {
                    return Err(RetryError::Exhausted { attempts, last: e });
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                warn!(
                    "{} failed (attempt {}/{}): {}, retrying in {:?}",
                    label, attempt, attempts, e, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Runs `work` as an atomic unit, re-running it from scratch on contention.
pub async fn run_atomic<T, E, F>(
    store: &ClinicStore,
    scope: &UnitScope,
    policy: &RetryPolicy,
    label: &str,
    mut work: F,
) -> Result<Committed<T>, RetryError<E>>
where
    F: FnMut(&mut Transaction) -> Result<T, E>,
    E: From<StoreError> + Transient + std::fmt::Display,
{
    let attempts = policy.max_attempts();
    let mut attempt = 0;

    loop {
        match store.atomic(scope, &mut work).await {
            Ok(committed) => return Ok(committed),
            Err(e) if !e.is_transient() => return Err(RetryError::Aborted(e)),
            Err(e) => {
                attempt += 1;
                if attempt >= attempts {
                    return Err(RetryError::Exhausted { attempts, last: e });
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                warn!(
                    "{} conflicted (attempt {}/{}): {}, retrying in {:?}",
                    label, attempt, attempts, e, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::cell::Cell;
    use std::future::ready;

    #[test]
    fn delays_double_from_initial() {
        let policy = RetryPolicy::new().with_initial_delay(Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_exhausted() {
        let policy = RetryPolicy::new().with_initial_delay(Duration::from_millis(1));
        let calls = Cell::new(0);

        let result: Result<(), _> = retry(
            &policy,
            "test",
            || {
                calls.set(calls.get() + 1);
                ready(Err::<(), _>(StoreError::Poisoned))
            },
            |_| true,
        )
        .await;

        assert_eq!(calls.get(), 3);
        assert_matches!(result, Err(RetryError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn permanent_errors_abort_immediately() {
        let policy = RetryPolicy::new().with_initial_delay(Duration::from_millis(1));
        let calls = Cell::new(0);

        let result: Result<(), _> = retry(
            &policy,
            "test",
            || {
                calls.set(calls.get() + 1);
                ready(Err::<(), _>(StoreError::Poisoned))
            },
            StoreError::is_transient,
        )
        .await;

        assert_eq!(calls.get(), 1);
        assert_matches!(result, Err(RetryError::Aborted(StoreError::Poisoned)));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failure() {
        let policy = RetryPolicy::new().with_initial_delay(Duration::from_millis(1));
        let calls = Cell::new(0);

        let result = retry(
            &policy,
            "test",
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 2 {
                    ready(Err(StoreError::Poisoned))
                } else {
                    ready(Ok(calls.get()))
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), 2);
    }
}
