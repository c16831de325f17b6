//! Telemetry events carried by the bus.
//!
//! There is one event type per [`EventKind`], and one channel per kind. Producers build an
//! event, push it, and from then on every subscriber sees the same `Arc`-shared value; none
//! can mutate it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Category of telemetry, each with its own schema and channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Trace,
    Error,
    JobOutcome,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Trace, EventKind::Error, EventKind::JobOutcome];

    /// Stable name used for channel names, labels and bridge subjects.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Trace => "tracing",
            EventKind::Error => "error",
            EventKind::JobOutcome => "schedule",
        }
    }

    /// Default sub-path for archived batches of this kind.
    pub fn archive_dir(&self) -> &'static str {
        match self {
            EventKind::Trace => "tracing",
            EventKind::Error => "errorReport",
            EventKind::JobOutcome => "schedule",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by the three event types so channels and writers can be generic over them.
pub trait Event: fmt::Debug + Send + Sync + 'static {
    const KIND: EventKind;
}

/// One observed inbound request or outbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Logical operation, usually the matched route without its query string.
    pub operation: String,
    pub uri: String,
    pub method: String,
    #[serde(default)]
    pub request_body: String,
    #[serde(default)]
    pub response_body: String,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    pub status: u16,
    /// Opaque correlation id set by the instrumented handler.
    #[serde(default)]
    pub target_id: u64,
    #[serde(default)]
    pub client_ip: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub tenant: String,
    #[serde(default)]
    pub operator: String,
    pub started_at: DateTime<Utc>,
}

impl TraceEvent {
    /// A trace for `method uri` started now; the operation defaults to the path.
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        Self {
            operation: strip_query(&uri).to_string(),
            uri,
            method: method.into(),
            request_body: String::new(),
            response_body: String::new(),
            duration: Duration::ZERO,
            status: 0,
            target_id: 0,
            client_ip: String::new(),
            user_agent: String::new(),
            device: String::new(),
            tenant: String::new(),
            operator: String::new(),
            started_at: Utc::now(),
        }
    }

    /// A trace for an outbound call; the operation is `[METHOD]path`.
    pub fn outbound(method: impl Into<String>, url: impl Into<String>) -> Self {
        let mut event = Self::new(method, url);
        event.operation = format!("[{}]{}", event.method, event.operation);
        event
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = strip_query(&operation.into()).to_string();
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = ip.into();
        self
    }

    pub fn with_bodies(mut self, request: impl Into<String>, response: impl Into<String>) -> Self {
        self.request_body = request.into();
        self.response_body = response.into();
        self
    }

    pub fn with_identity(mut self, tenant: impl Into<String>, operator: impl Into<String>) -> Self {
        self.tenant = tenant.into();
        self.operator = operator.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn with_target_id(mut self, id: u64) -> Self {
        self.target_id = id;
        self
    }

    pub fn is_failure(&self) -> bool {
        self.status >= 400
    }
}

impl Event for TraceEvent {
    const KIND: EventKind = EventKind::Trace;
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {} in {:?}", self.method, self.uri, self.status, self.duration)
    }
}

/// Error value carried when the original error type is gone, e.g. after crossing a bridge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ReportedError(pub String);

/// One captured failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "ErrorRecord", from = "ErrorRecord")]
pub struct ErrorEvent {
    pub error: Arc<dyn std::error::Error + Send + Sync>,
    /// Empty for failures outside an HTTP exchange.
    pub uri: String,
    /// Raw diagnostic blob: stack trace or dumped response.
    pub full_stack: Vec<u8>,
    pub happened_at: DateTime<Utc>,
}

impl ErrorEvent {
    pub fn new<E>(error: E, uri: impl Into<String>) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self { error: Arc::new(error), uri: uri.into(), full_stack: Vec::new(), happened_at: Utc::now() }
    }

    /// Capture a borrowed error by rendering it and its source chain.
    pub fn from_error(error: &(dyn std::error::Error + 'static), uri: impl Into<String>) -> Self {
        Self::new(ReportedError(render_chain(error)), uri)
    }

    pub fn with_full_stack(mut self, blob: impl Into<Vec<u8>>) -> Self {
        self.full_stack = blob.into();
        self
    }

    /// The error and all of its sources joined with `: `.
    pub fn message(&self) -> String {
        render_chain(self.error.as_ref())
    }
}

impl Event for ErrorEvent {
    const KIND: EventKind = EventKind::Error;
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.uri.is_empty() {
            write!(f, "{}", self.message())
        } else {
            write!(f, "{} ({})", self.message(), self.uri)
        }
    }
}

/// Flat, serializable shape of an [`ErrorEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub uri: String,
    pub full_stack: String,
    pub error: String,
    pub happened_at: DateTime<Utc>,
}

impl From<&ErrorEvent> for ErrorRecord {
    fn from(event: &ErrorEvent) -> Self {
        Self {
            uri: event.uri.clone(),
            full_stack: String::from_utf8_lossy(&event.full_stack).into_owned(),
            error: event.message(),
            happened_at: event.happened_at,
        }
    }
}

impl From<ErrorEvent> for ErrorRecord {
    fn from(event: ErrorEvent) -> Self {
        ErrorRecord::from(&event)
    }
}

impl From<ErrorRecord> for ErrorEvent {
    fn from(record: ErrorRecord) -> Self {
        Self {
            error: Arc::new(ReportedError(record.error)),
            uri: record.uri,
            full_stack: record.full_stack.into_bytes(),
            happened_at: record.happened_at,
        }
    }
}

/// One scheduled-job completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcomeEvent {
    pub app: String,
    pub job: String,
    pub succeed: bool,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
}

impl JobOutcomeEvent {
    pub fn new(app: impl Into<String>, job: impl Into<String>, succeed: bool, duration: Duration) -> Self {
        Self { app: app.into(), job: job.into(), succeed, duration }
    }

    pub fn outcome(&self) -> &'static str {
        if self.succeed {
            "succeeded"
        } else {
            "failed"
        }
    }
}

impl Event for JobOutcomeEvent {
    const KIND: EventKind = EventKind::JobOutcome;
}

impl fmt::Display for JobOutcomeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {} in {:?}", self.app, self.job, self.outcome(), self.duration)
    }
}

fn strip_query(uri: &str) -> &str {
    match uri.find('?') {
        Some(index) => &uri[..index],
        None => uri,
    }
}

fn render_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
