//! Delay schedules for delivery retries.
//!
//! Attempt index `0` is the initial call and never waits; retries start at `attempt = 1`.
//! The default sink schedule is exponential from 100ms capped at 400ms, i.e. the waits
//! between three attempts are 100ms then 200ms.
//!
//! ```rust
//! use std::time::Duration;
//! use tracebus::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_millis(400))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(5), Duration::from_millis(400));
//! ```

use std::fmt;
use std::time::Duration;

/// Delays saturate here instead of overflowing (1 hour).
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    ConstantDoesNotSupportMax,
    MaxLessThanBase { base: Duration, max: Duration },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::ConstantDoesNotSupportMax => {
                write!(f, "with_max is only valid for exponential backoff")
            }
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max ({:?}) must be >= base ({:?})", max, base)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schedule {
    Constant,
    Exponential { max: Option<Duration> },
}

/// Wait computed before each retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    schedule: Schedule,
}

impl Backoff {
    /// Same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { base: delay, schedule: Schedule::Constant }
    }

    /// `base * 2^(attempt-1)`, optionally capped with [`Backoff::with_max`].
    pub fn exponential(base: Duration) -> Self {
        Self { base, schedule: Schedule::Exponential { max: None } }
    }

    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        match &mut self.schedule {
            Schedule::Constant => Err(BackoffError::ConstantDoesNotSupportMax),
            Schedule::Exponential { max: existing } => {
                if max < self.base {
                    return Err(BackoffError::MaxLessThanBase { base: self.base, max });
                }
                *existing = Some(max);
                Ok(self)
            }
        }
    }

    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let raw = match self.schedule {
            Schedule::Constant => self.base,
            Schedule::Exponential { max } => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let nanos = self.base.as_nanos().saturating_mul(2u128.saturating_pow(exponent));
                let grown = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
                max.map(|m| grown.min(m)).unwrap_or(grown)
            }
        };
        raw.min(MAX_BACKOFF)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            schedule: Schedule::Exponential { max: Some(Duration::from_millis(400)) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_is_100_200_400() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(9), Duration::from_millis(400));
    }

    #[test]
    fn constant_ignores_attempt_number() {
        let backoff = Backoff::constant(Duration::from_millis(50));
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_millis(50));
        assert_eq!(backoff.delay(40), Duration::from_millis(50));
    }

    #[test]
    fn huge_attempt_saturates() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay(1_000_000_000), MAX_BACKOFF);
    }

    #[test]
    fn with_max_validates() {
        assert!(matches!(
            Backoff::constant(Duration::from_secs(1)).with_max(Duration::from_secs(2)),
            Err(BackoffError::ConstantDoesNotSupportMax)
        ));
        assert!(matches!(
            Backoff::exponential(Duration::from_secs(2)).with_max(Duration::from_secs(1)),
            Err(BackoffError::MaxLessThanBase { .. })
        ));
    }
}
