//! Sinks that need no external backend: console logging, in-memory recording, and a
//! record-store adapter.

use crate::error::SinkError;
use crate::event::{ErrorEvent, JobOutcomeEvent, TraceEvent};
use crate::filter::{DeliveryFilter, Filter};
use crate::sink::{FilterableSink, Sink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tower::BoxError;

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct ConsoleSink {
    request_bodies: bool,
    response_bodies: bool,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also log request and/or response bodies of traces.
    pub fn with_bodies(mut self, request: bool, response: bool) -> Self {
        self.request_bodies = request;
        self.response_bodies = response;
        self
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    async fn report_trace(&self, event: &TraceEvent) -> Result<(), SinkError> {
        tracing::info!(
            method = %event.method,
            uri = %event.uri,
            status = event.status,
            duration_ms = event.duration.as_millis() as u64,
            client_ip = %event.client_ip,
            "trace"
        );
        if self.request_bodies && !event.request_body.is_empty() {
            tracing::debug!(uri = %event.uri, body = %event.request_body, "request body");
        }
        if self.response_bodies && !event.response_body.is_empty() {
            tracing::debug!(uri = %event.uri, body = %event.response_body, "response body");
        }
        Ok(())
    }

    async fn report_error(&self, event: &ErrorEvent) -> Result<(), SinkError> {
        tracing::warn!(uri = %event.uri, error = %event.message(), "error reported");
        Ok(())
    }

    async fn report_job_outcome(&self, event: &JobOutcomeEvent) -> Result<(), SinkError> {
        tracing::info!(
            app = %event.app,
            job = %event.job,
            outcome = event.outcome(),
            duration_ms = event.duration.as_millis() as u64,
            "job finished"
        );
        Ok(())
    }
}

/// Records everything it receives, keeping at most `capacity` events per kind.
#[derive(Debug, Clone)]
pub struct MemorySink {
    inner: Arc<Recorded>,
    capacity: usize,
    filter: Option<Arc<Filter>>,
}

#[derive(Debug, Default)]
struct Recorded {
    traces: Mutex<VecDeque<TraceEvent>>,
    errors: Mutex<VecDeque<ErrorEvent>>,
    jobs: Mutex<VecDeque<JobOutcomeEvent>>,
    evicted: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { inner: Arc::new(Recorded::default()), capacity: capacity.max(1), filter: None }
    }

    /// Use `filter` instead of the hub's default for traces.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn traces(&self) -> Vec<TraceEvent> {
        lock(&self.inner.traces).iter().cloned().collect()
    }

    pub fn errors(&self) -> Vec<ErrorEvent> {
        lock(&self.inner.errors).iter().cloned().collect()
    }

    pub fn job_outcomes(&self) -> Vec<JobOutcomeEvent> {
        lock(&self.inner.jobs).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.traces).len() + lock(&self.inner.errors).len() + lock(&self.inner.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.inner.traces).clear();
        lock(&self.inner.errors).clear();
        lock(&self.inner.jobs).clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.inner.evicted.load(Ordering::Relaxed)
    }

    fn record<T>(&self, queue: &Mutex<VecDeque<T>>, event: T) {
        let mut guard = lock(queue);
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.inner.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn report_trace(&self, event: &TraceEvent) -> Result<(), SinkError> {
        self.record(&self.inner.traces, event.clone());
        Ok(())
    }

    async fn report_error(&self, event: &ErrorEvent) -> Result<(), SinkError> {
        self.record(&self.inner.errors, event.clone());
        Ok(())
    }

    async fn report_job_outcome(&self, event: &JobOutcomeEvent) -> Result<(), SinkError> {
        self.record(&self.inner.jobs, event.clone());
        Ok(())
    }

    fn as_filterable(&self) -> Option<&dyn FilterableSink> {
        self.filter.as_ref().map(|_| self as &dyn FilterableSink)
    }
}

impl FilterableSink for MemorySink {
    fn filter(&self) -> &dyn DeliveryFilter {
        static OPEN: Filter = Filter::open();
        match &self.filter {
            Some(filter) => filter.as_ref(),
            None => &OPEN,
        }
    }
}

/// Flat row persisted for each trace by a [`StoreSink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub operation: String,
    pub uri: String,
    pub method: String,
    pub status: u16,
    pub duration_ms: u64,
    pub target_id: u64,
    pub request_body: String,
    pub response_body: String,
    pub client_ip: String,
    pub user_agent: String,
    pub device: String,
    pub tenant: String,
    pub operator: String,
    pub created_at: DateTime<Utc>,
}

impl From<&TraceEvent> for RequestRecord {
    fn from(event: &TraceEvent) -> Self {
        Self {
            operation: event.operation.clone(),
            uri: event.uri.clone(),
            method: event.method.clone(),
            status: event.status,
            duration_ms: u64::try_from(event.duration.as_millis()).unwrap_or(u64::MAX),
            target_id: event.target_id,
            request_body: event.request_body.clone(),
            response_body: event.response_body.clone(),
            client_ip: event.client_ip.clone(),
            user_agent: event.user_agent.clone(),
            device: event.device.clone(),
            tenant: event.tenant.clone(),
            operator: event.operator.clone(),
            created_at: event.started_at,
        }
    }
}

/// Persistence backend for [`RequestRecord`]s.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    async fn save(&self, record: RequestRecord) -> Result<(), BoxError>;
}

/// Saves one [`RequestRecord`] per trace. Errors and job outcomes are not stored.
#[derive(Debug, Clone)]
pub struct StoreSink<S> {
    store: S,
}

impl<S> StoreSink<S>
where
    S: RecordStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S> Sink for StoreSink<S>
where
    S: RecordStore,
{
    async fn report_trace(&self, event: &TraceEvent) -> Result<(), SinkError> {
        self.store.save(RequestRecord::from(event)).await.map_err(SinkError::Other)
    }

    async fn report_error(&self, _event: &ErrorEvent) -> Result<(), SinkError> {
        Ok(())
    }

    async fn report_job_outcome(&self, _event: &JobOutcomeEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
