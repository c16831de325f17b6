//! Per-attempt time budget.

use crate::ResilienceError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Returns `None` for a zero duration, which could never succeed.
    pub fn new(duration: Duration) -> Option<Self> {
        (!duration.is_zero()).then_some(Self { duration })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub async fn execute<T, E, Fut>(&self, operation: Fut) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        match tokio::time::timeout(self.duration, operation).await {
            Ok(result) => result.map_err(ResilienceError::Inner),
            Err(_) => Err(ResilienceError::Timeout { elapsed: start.elapsed(), timeout: self.duration }),
        }
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self { duration: Duration::from_secs(2) }
    }
}
