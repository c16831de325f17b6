//! Loki sink for `tracebus`.
//!
//! Every event becomes one JSON log line in a stream labelled with the process identity and
//! the event's own fields. Pushes go over HTTP by default; when that client cannot be built
//! the sink falls back to gRPC, and when neither can be built construction fails so the hub
//! skips the sink.
//!
//! Each push is tried up to `max_attempts` times with exponential backoff, each attempt
//! bounded by `timeout_ms`. Lines longer than `max_line_bytes` are shortened before sending.
//!
//! ```rust,no_run
//! use tracebus::prelude::*;
//! use tracebus_loki::{LokiSettings, LokiSink};
//!
//! # async fn wire(hub: &Hub) {
//! let settings = LokiSettings::from_yaml_str("url: http://loki:3100").unwrap();
//! let identity = ProcessIdentity::detect(&Default::default());
//! hub.try_register(LokiSink::new(&settings, &identity));
//! # }
//! ```

mod client;
mod labels;
mod proto;
mod settings;

pub use client::{connect, GrpcPushClient, HttpPushClient, PushClient};
pub use labels::LabelSet;
pub use settings::{LokiSettings, Protocol, DEFAULT_MAX_LINE_BYTES, MIN_MAX_LINE_BYTES};

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracebus::backoff::Backoff;
use tracebus::error::{ConfigError, SinkError};
use tracebus::event::{ErrorEvent, ErrorRecord, JobOutcomeEvent, TraceEvent};
use tracebus::filter::{DeliveryFilter, Filter};
use tracebus::retry::RetryPolicy;
use tracebus::settings::ProcessIdentity;
use tracebus::sink::{FilterableSink, Sink};
use tracebus::sleeper::Sleeper;
use tracebus::timeout::TimeoutPolicy;
use tracebus::truncate::encode_within;

pub struct LokiSink {
    client: Arc<dyn PushClient>,
    labels: LabelSet,
    retry: RetryPolicy<SinkError>,
    timeout: TimeoutPolicy,
    max_line_bytes: usize,
    filter: Option<Filter>,
}

impl std::fmt::Debug for LokiSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LokiSink")
            .field("protocol", &self.client.protocol())
            .field("labels", &self.labels)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl LokiSink {
    /// Build the transport for `settings` (with protocol fallback) and the sink around it.
    pub fn new(settings: &LokiSettings, identity: &ProcessIdentity) -> Result<Self, ConfigError> {
        let client = connect(settings)?;
        tracing::info!(url = %settings.url, protocol = client.protocol().as_str(), "loki sink ready");
        Self::with_client(client, settings, identity)
    }

    /// Use an already built transport.
    pub fn with_client(
        client: Arc<dyn PushClient>,
        settings: &LokiSettings,
        identity: &ProcessIdentity,
    ) -> Result<Self, ConfigError> {
        let timeout = TimeoutPolicy::new(settings.timeout())
            .ok_or(ConfigError::Invalid { key: "timeout_ms", reason: "must be > 0".into() })?;
        if settings.max_line_bytes < MIN_MAX_LINE_BYTES {
            return Err(ConfigError::Invalid {
                key: "max_line_bytes",
                reason: format!("{} is below the minimum of {MIN_MAX_LINE_BYTES}", settings.max_line_bytes),
            });
        }
        let filter = if settings.filter.is_empty() { None } else { Some(settings.filter.compile()?) };
        Ok(Self {
            client,
            labels: LabelSet::for_process(identity),
            retry: retry_policy(settings, None)?,
            timeout,
            max_line_bytes: settings.max_line_bytes,
            filter,
        })
    }

    /// Replace the timer used between attempts.
    pub fn with_sleeper<S>(mut self, settings: &LokiSettings, sleeper: S) -> Result<Self, ConfigError>
    where
        S: Sleeper + 'static,
    {
        self.retry = retry_policy(settings, Some(Arc::new(sleeper)))?;
        Ok(self)
    }

    pub fn protocol(&self) -> Protocol {
        self.client.protocol()
    }

    async fn deliver<T: Serialize + ?Sized>(&self, labels: LabelSet, payload: &T) -> Result<(), SinkError> {
        let encoded = encode_within(payload, self.max_line_bytes)?;
        if encoded.truncated() {
            tracing::warn!(
                kind = labels.get("kind").unwrap_or_default(),
                original = encoded.original_len,
                sent = encoded.json.len(),
                "loki line truncated"
            );
        }

        let client = &self.client;
        let timeout = &self.timeout;
        let labels = &labels;
        let line = encoded.json.as_str();
        self.retry
            .execute(move || timeout.execute(client.push(labels, line)))
            .await
            .map_err(SinkError::from)
    }
}

fn retry_policy(
    settings: &LokiSettings,
    sleeper: Option<Arc<dyn Sleeper>>,
) -> Result<RetryPolicy<SinkError>, ConfigError> {
    let backoff = Backoff::exponential(Duration::from_millis(settings.backoff_ms))
        .with_max(Duration::from_millis(settings.max_backoff_ms))
        .map_err(|e| ConfigError::Invalid { key: "max_backoff_ms", reason: e.to_string() })?;
    let mut builder = RetryPolicy::builder()
        .max_attempts(settings.max_attempts)
        .backoff(backoff)
        .should_retry(is_transient);
    if let Some(sleeper) = sleeper {
        builder = builder.with_shared_sleeper(sleeper);
    }
    builder.build().map_err(|e| ConfigError::Invalid { key: "max_attempts", reason: e.to_string() })
}

/// Client errors other than throttling will not improve on retry.
fn is_transient(error: &SinkError) -> bool {
    !matches!(error, SinkError::Status { status, .. } if (400..500).contains(status) && *status != 429)
}

#[async_trait]
impl Sink for LokiSink {
    async fn report_trace(&self, event: &TraceEvent) -> Result<(), SinkError> {
        self.deliver(self.labels.for_trace(event), event).await
    }

    async fn report_error(&self, event: &ErrorEvent) -> Result<(), SinkError> {
        self.deliver(self.labels.for_error(event), &ErrorRecord::from(event)).await
    }

    async fn report_job_outcome(&self, event: &JobOutcomeEvent) -> Result<(), SinkError> {
        self.deliver(self.labels.for_job(event), event).await
    }

    fn as_filterable(&self) -> Option<&dyn FilterableSink> {
        self.filter.as_ref().map(|_| self as &dyn FilterableSink)
    }
}

impl FilterableSink for LokiSink {
    fn filter(&self) -> &dyn DeliveryFilter {
        static OPEN: Filter = Filter::open();
        self.filter.as_ref().map_or(&OPEN as &dyn DeliveryFilter, |f| f as &dyn DeliveryFilter)
    }
}
