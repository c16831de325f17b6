//! Composition root: one channel per event kind, plus the sinks and writers attached to them.
//!
//! ```rust
//! use std::sync::Arc;
//! use tracebus::{Hub, HubConfig, MemorySink, TraceEvent};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let hub = Hub::new(HubConfig::default()).unwrap();
//! let memory = Arc::new(MemorySink::new());
//! hub.register_sink(memory.clone());
//! hub.start();
//!
//! hub.push_trace(TraceEvent::new("GET", "/api/users").with_status(200));
//! hub.shutdown().await;
//! assert_eq!(memory.traces().len(), 1);
//! # });
//! ```

use crate::batch::{BatchWriter, Drain};
use crate::channel::{ChannelStats, EventChannel, DEFAULT_CAPACITY};
use crate::error::ConfigError;
use crate::event::{ErrorEvent, Event, EventKind, JobOutcomeEvent, TraceEvent};
use crate::filter::{DeliveryFilter, FilterRule};
use crate::settings::Settings;
use crate::sink::{FilterLayer, Sink, SinkHandler};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::Layer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    pub channel_capacity: usize,
    pub drain_timeout: Duration,
    pub default_filter: FilterRule,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CAPACITY,
            drain_timeout: Duration::from_secs(5),
            default_filter: FilterRule::default(),
        }
    }
}

impl From<&Settings> for HubConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            channel_capacity: settings.channel_capacity,
            drain_timeout: settings.drain_timeout(),
            default_filter: settings.filter.clone(),
        }
    }
}

/// Event types the hub has a channel for.
pub trait Routed: Event + Sized {
    fn channel(hub: &Hub) -> &EventChannel<Self>;
}

impl Routed for TraceEvent {
    fn channel(hub: &Hub) -> &EventChannel<Self> {
        &hub.traces
    }
}

impl Routed for ErrorEvent {
    fn channel(hub: &Hub) -> &EventChannel<Self> {
        &hub.errors
    }
}

impl Routed for JobOutcomeEvent {
    fn channel(hub: &Hub) -> &EventChannel<Self> {
        &hub.jobs
    }
}

/// Owns the three channels. Clones share them, so producers can hold their own handle.
#[derive(Clone)]
pub struct Hub {
    traces: EventChannel<TraceEvent>,
    errors: EventChannel<ErrorEvent>,
    jobs: EventChannel<JobOutcomeEvent>,
    default_filter: Arc<dyn DeliveryFilter>,
    writers: Arc<Mutex<Vec<Arc<dyn Drain>>>>,
    drain_timeout: Duration,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("traces", &self.traces)
            .field("errors", &self.errors)
            .field("jobs", &self.jobs)
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

impl Hub {
    pub fn new(config: HubConfig) -> Result<Self, ConfigError> {
        let default_filter = config.default_filter.compile()?;
        Ok(Self {
            traces: EventChannel::new(EventKind::Trace.as_str(), config.channel_capacity),
            errors: EventChannel::new(EventKind::Error.as_str(), config.channel_capacity),
            jobs: EventChannel::new(EventKind::JobOutcome.as_str(), config.channel_capacity),
            default_filter: Arc::new(default_filter),
            writers: Arc::new(Mutex::new(Vec::new())),
            drain_timeout: config.drain_timeout,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Self::new(HubConfig::from(settings))
    }

    pub fn channel<E: Routed>(&self) -> &EventChannel<E> {
        E::channel(self)
    }

    pub fn push<E: Routed>(&self, event: E) {
        E::channel(self).push(event);
    }

    pub fn push_trace(&self, event: TraceEvent) {
        self.traces.push(event);
    }

    pub fn push_error(&self, event: ErrorEvent) {
        self.errors.push(event);
    }

    /// Capture a borrowed error as an [`ErrorEvent`].
    pub fn report_error(&self, error: &(dyn std::error::Error + 'static), uri: &str) {
        self.errors.push(ErrorEvent::from_error(error, uri));
    }

    pub fn push_job_outcome(&self, event: JobOutcomeEvent) {
        self.jobs.push(event);
    }

    /// Subscribe `sink` to every channel under its type name.
    pub fn register_sink<S: Sink>(&self, sink: Arc<S>) {
        let name = std::any::type_name::<S>();
        let filter = FilterLayer::for_sink(&sink, Arc::clone(&self.default_filter));
        let own_filter = sink.as_filterable().is_some();

        self.traces.subscribe(name, filter.layer(SinkHandler::new(Arc::clone(&sink))));
        self.errors.subscribe(name, SinkHandler::new(Arc::clone(&sink)));
        self.jobs.subscribe(name, SinkHandler::new(sink));
        tracing::info!(sink = name, own_filter, "sink registered");
    }

    /// Register a sink whose construction may have failed; a failure is logged and skipped.
    pub fn try_register<S: Sink>(&self, sink: Result<S, ConfigError>) -> bool {
        match sink {
            Ok(sink) => {
                self.register_sink(Arc::new(sink));
                true
            }
            Err(error) => {
                tracing::error!(sink = std::any::type_name::<S>(), error = %error, "sink not registered");
                false
            }
        }
    }

    /// Subscribe a batch writer to the channel of its kind; the hub flushes it on shutdown.
    pub fn attach_writer<E: Routed>(&self, writer: BatchWriter<E>) {
        let name = format!("batch:{}", writer.name());
        E::channel(self).subscribe(name, writer.clone());
        self.writers.lock().unwrap_or_else(|p| p.into_inner()).push(Arc::new(writer));
    }

    /// Start every dispatch loop. Must run inside a tokio runtime.
    pub fn start(&self) {
        self.traces.start();
        self.errors.start();
        self.jobs.start();
    }

    pub fn stats(&self, kind: EventKind) -> ChannelStats {
        match kind {
            EventKind::Trace => self.traces.stats(),
            EventKind::Error => self.errors.stats(),
            EventKind::JobOutcome => self.jobs.stats(),
        }
    }

    /// Drain the channels, then flush the writers, within the configured drain timeout.
    pub async fn shutdown(&self) {
        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        futures::join!(
            self.traces.stop(self.drain_timeout),
            self.errors.stop(self.drain_timeout),
            self.jobs.stop(self.drain_timeout),
        );

        let writers: Vec<_> = self.writers.lock().unwrap_or_else(|p| p.into_inner()).drain(..).collect();
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        futures::future::join_all(writers.iter().map(|writer| writer.shutdown(remaining))).await;
        tracing::info!(writers = writers.len(), "hub stopped");
    }
}
