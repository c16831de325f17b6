//! Bounded retry for sink deliveries.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - `Inner` failures and per-attempt `Timeout`s are retried; the first success
//!   short-circuits.
//! - `should_retry` can mark an `Inner` error as permanent, which returns it immediately.
//! - Exhausting the attempts yields `RetryExhausted` carrying the recorded failures, the
//!   last one being the error the caller logs. Nothing is requeued.
//!
//! ```rust
//! use std::time::Duration;
//! use tracebus::{Backoff, InstantSleeper, ResilienceError, RetryPolicy, SinkError};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::<SinkError>::builder()
//!     .max_attempts(3)
//!     .backoff(Backoff::exponential(Duration::from_millis(100)))
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//! let result: Result<(), _> =
//!     policy.execute(|| async { Err(ResilienceError::Inner(SinkError::transport("down"))) }).await;
//! assert!(result.unwrap_err().is_retry_exhausted());
//! # });
//! ```

use crate::{Backoff, ResilienceError, Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;

/// Retry policy combining attempt budget, backoff, predicate, and sleeper.
#[derive(Clone)]
pub struct RetryPolicy<E> {
    max_attempts: usize,
    backoff: Backoff,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: Send + Sync + 'static,
{
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Run `operation` until it succeeds, fails permanently, or the budget is spent.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        let mut failures = Vec::new();

        for attempt in 0..self.max_attempts {
            let failure = match operation().await {
                Ok(value) => return Ok(value),
                Err(ResilienceError::Inner(e)) if !(self.should_retry)(&e) => {
                    return Err(ResilienceError::Inner(e));
                }
                Err(err @ ResilienceError::RetryExhausted { .. }) => return Err(err),
                Err(err) => err,
            };

            tracing::debug!(attempt = attempt + 1, max = self.max_attempts, "delivery attempt failed");
            failures.push(failure);

            if attempt + 1 < self.max_attempts {
                self.sleeper.sleep(self.backoff.delay(attempt + 1)).await;
            }
        }

        Err(ResilienceError::retry_exhausted(self.max_attempts, failures))
    }
}

/// Builder for `RetryPolicy`.
pub struct RetryPolicyBuilder<E> {
    max_attempts: usize,
    backoff: Backoff,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
}

impl<E> RetryPolicyBuilder<E>
where
    E: Send + Sync + 'static,
{
    /// Three attempts, 100/200ms exponential backoff, tokio timer.
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            should_retry: Arc::new(|_| true),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_shared_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn build(self) -> Result<RetryPolicy<E>, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
