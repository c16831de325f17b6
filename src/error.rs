//! Error types shared by the channel, the sinks and the resilience primitives.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Cap the number of stored failures inside RetryExhausted to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Outcome of a retried or time-bounded operation.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// A single attempt exceeded its time budget
    Timeout { elapsed: Duration, timeout: Duration },
    /// All retry attempts were exhausted
    RetryExhausted { attempts: usize, failures: Arc<Vec<ResilienceError<E>>> },
    /// The underlying operation failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "attempt timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::RetryExhausted { attempts, failures } => match failures.last() {
                Some(last) => {
                    write!(f, "retry exhausted after {} attempts; last error: {}", attempts, last)
                }
                None => write!(f, "retry exhausted after {} attempts", attempts),
            },
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            Self::Timeout { .. } => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Construct a `RetryExhausted` keeping only the most recent `MAX_RETRY_FAILURES` failures.
    pub fn retry_exhausted(attempts: usize, failures: Vec<ResilienceError<E>>) -> Self {
        let trimmed = if failures.len() > MAX_RETRY_FAILURES {
            failures.into_iter().rev().take(MAX_RETRY_FAILURES).rev().collect()
        } else {
            failures
        };
        ResilienceError::RetryExhausted { attempts, failures: Arc::new(trimmed) }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// The last failure recorded by a retry loop, or `self` for single failures.
    pub fn last_failure(&self) -> &ResilienceError<E> {
        match self {
            Self::RetryExhausted { failures, .. } => failures.last().unwrap_or(self),
            other => other,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self.last_failure() {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Failure reported by a sink for a single event.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote rejected push with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
    #[error("delivery failed after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: String },
    #[error("{0}")]
    Other(#[from] tower::BoxError),
}

impl SinkError {
    pub fn transport(err: impl fmt::Display) -> Self {
        SinkError::Transport(err.to_string())
    }
}

impl From<ResilienceError<SinkError>> for SinkError {
    fn from(err: ResilienceError<SinkError>) -> Self {
        match err {
            ResilienceError::Inner(e) => e,
            ResilienceError::Timeout { timeout, .. } => SinkError::Timeout(timeout),
            ResilienceError::RetryExhausted { attempts, failures } => SinkError::Exhausted {
                attempts,
                last: failures.last().map(|f| f.to_string()).unwrap_or_default(),
            },
        }
    }
}

/// A sink or writer could not be built from its settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("invalid url `{0}`")]
    InvalidUrl(String),
    #[error("unsupported protocol `{0}`")]
    UnsupportedProtocol(String),
    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("client construction failed: {0}")]
    Client(String),
}

/// Why `EventChannel::try_push` refused an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("channel `{0}` is full")]
    Full(&'static str),
    #[error("channel `{0}` is closed")]
    Closed(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("boom {0}")]
    struct Boom(u32);

    #[test]
    fn retry_exhausted_keeps_most_recent_failures() {
        let failures = (0..15).map(|i| ResilienceError::Inner(Boom(i))).collect();
        let err = ResilienceError::retry_exhausted(15, failures);
        match &err {
            ResilienceError::RetryExhausted { failures, .. } => {
                assert_eq!(failures.len(), MAX_RETRY_FAILURES);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(err.as_inner(), Some(&Boom(14)));
        assert_eq!(err.to_string(), "retry exhausted after 15 attempts; last error: boom 14");
    }

    #[test]
    fn sink_error_from_exhausted_carries_last_message() {
        let err: ResilienceError<SinkError> = ResilienceError::retry_exhausted(
            3,
            vec![
                ResilienceError::Inner(SinkError::transport("refused")),
                ResilienceError::Timeout {
                    elapsed: Duration::from_secs(2),
                    timeout: Duration::from_secs(2),
                },
            ],
        );
        match SinkError::from(err) {
            SinkError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(last.contains("timed out"), "got {last}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn push_error_names_channel() {
        assert_eq!(PushError::Full("tracing").to_string(), "channel `tracing` is full");
    }
}
