//! The contract every delivery target implements, and the adapters that subscribe a sink to
//! the per-kind channels.
//!
//! A sink reports one event at a time and returns `Ok(())` or a [`SinkError`]. The error is
//! logged by the channel with the sink's subscriber name and the event is dropped for that
//! sink only.
//!
//! Trace delivery is gated by a [`DeliveryFilter`]. A sink that implements [`FilterableSink`]
//! and returns itself from [`Sink::as_filterable`] brings its own filter; every other sink
//! gets the hub's shared default. A filtered-out trace counts as delivered.

use crate::channel::Handler;
use crate::error::SinkError;
use crate::event::{ErrorEvent, JobOutcomeEvent, TraceEvent};
use crate::filter::DeliveryFilter;
use async_trait::async_trait;
use std::sync::Arc;
use tower::{BoxError, Layer};

/// A delivery target for all three event kinds.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    async fn report_trace(&self, event: &TraceEvent) -> Result<(), SinkError>;

    async fn report_error(&self, event: &ErrorEvent) -> Result<(), SinkError>;

    async fn report_job_outcome(&self, event: &JobOutcomeEvent) -> Result<(), SinkError>;

    /// Capability hook: return `Some(self)` when the sink carries its own filter.
    fn as_filterable(&self) -> Option<&dyn FilterableSink> {
        None
    }
}

/// A sink that decides for itself which traces it wants.
pub trait FilterableSink: Send + Sync {
    fn filter(&self) -> &dyn DeliveryFilter;
}

#[async_trait]
impl<S> Sink for Arc<S>
where
    S: Sink + ?Sized,
{
    async fn report_trace(&self, event: &TraceEvent) -> Result<(), SinkError> {
        (**self).report_trace(event).await
    }

    async fn report_error(&self, event: &ErrorEvent) -> Result<(), SinkError> {
        (**self).report_error(event).await
    }

    async fn report_job_outcome(&self, event: &JobOutcomeEvent) -> Result<(), SinkError> {
        (**self).report_job_outcome(event).await
    }

    fn as_filterable(&self) -> Option<&dyn FilterableSink> {
        (**self).as_filterable()
    }
}

/// Subscribes one sink to a channel: implements [`Handler`] for every event kind.
pub struct SinkHandler<S: ?Sized> {
    sink: Arc<S>,
}

impl<S: ?Sized> SinkHandler<S> {
    pub fn new(sink: Arc<S>) -> Self {
        Self { sink }
    }
}

impl<S: ?Sized> Clone for SinkHandler<S> {
    fn clone(&self) -> Self {
        Self { sink: Arc::clone(&self.sink) }
    }
}

#[async_trait]
impl<S> Handler<TraceEvent> for SinkHandler<S>
where
    S: Sink + ?Sized,
{
    async fn handle(&self, event: Arc<TraceEvent>) -> Result<(), BoxError> {
        self.sink.report_trace(&event).await.map_err(Into::into)
    }
}

#[async_trait]
impl<S> Handler<ErrorEvent> for SinkHandler<S>
where
    S: Sink + ?Sized,
{
    async fn handle(&self, event: Arc<ErrorEvent>) -> Result<(), BoxError> {
        self.sink.report_error(&event).await.map_err(Into::into)
    }
}

#[async_trait]
impl<S> Handler<JobOutcomeEvent> for SinkHandler<S>
where
    S: Sink + ?Sized,
{
    async fn handle(&self, event: Arc<JobOutcomeEvent>) -> Result<(), BoxError> {
        self.sink.report_job_outcome(&event).await.map_err(Into::into)
    }
}

/// Delegates to the filter a [`FilterableSink`] exposes. A sink that stops exposing one
/// receives everything.
pub struct OwnFilter<S: ?Sized> {
    sink: Arc<S>,
}

impl<S: ?Sized> OwnFilter<S> {
    pub fn new(sink: Arc<S>) -> Self {
        Self { sink }
    }
}

impl<S> DeliveryFilter for OwnFilter<S>
where
    S: Sink + ?Sized,
{
    fn should_deliver(&self, event: &TraceEvent) -> bool {
        self.sink
            .as_filterable()
            .map_or(true, |filterable| filterable.filter().should_deliver(event))
    }
}

/// Wraps a trace handler so that the filter runs immediately before each invocation.
#[derive(Clone)]
pub struct FilterLayer {
    filter: Arc<dyn DeliveryFilter>,
}

impl FilterLayer {
    pub fn new(filter: Arc<dyn DeliveryFilter>) -> Self {
        Self { filter }
    }

    /// Pick the sink's own filter when it has one, `shared` otherwise.
    pub fn for_sink<S>(sink: &Arc<S>, shared: Arc<dyn DeliveryFilter>) -> Self
    where
        S: Sink + ?Sized,
    {
        if sink.as_filterable().is_some() {
            Self::new(Arc::new(OwnFilter::new(Arc::clone(sink))))
        } else {
            Self::new(shared)
        }
    }
}

impl<H> Layer<H> for FilterLayer {
    type Service = Filtered<H>;

    fn layer(&self, inner: H) -> Self::Service {
        Filtered { inner, filter: Arc::clone(&self.filter) }
    }
}

/// A trace handler behind a [`FilterLayer`].
pub struct Filtered<H> {
    inner: H,
    filter: Arc<dyn DeliveryFilter>,
}

#[async_trait]
impl<H> Handler<TraceEvent> for Filtered<H>
where
    H: Handler<TraceEvent>,
{
    async fn handle(&self, event: Arc<TraceEvent>) -> Result<(), BoxError> {
        if !self.filter.should_deliver(&event) {
            tracing::trace!(uri = %event.uri, client_ip = %event.client_ip, "trace filtered out");
            return Ok(());
        }
        self.inner.handle(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Filter, FilterRule};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        traces: AtomicUsize,
        own: Option<Filter>,
    }

    #[async_trait]
    impl Sink for Counting {
        async fn report_trace(&self, _event: &TraceEvent) -> Result<(), SinkError> {
            self.traces.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn report_error(&self, _event: &ErrorEvent) -> Result<(), SinkError> {
            Err(SinkError::transport("offline"))
        }

        async fn report_job_outcome(&self, _event: &JobOutcomeEvent) -> Result<(), SinkError> {
            Ok(())
        }

        fn as_filterable(&self) -> Option<&dyn FilterableSink> {
            self.own.as_ref().map(|_| self as &dyn FilterableSink)
        }
    }

    impl FilterableSink for Counting {
        fn filter(&self) -> &dyn DeliveryFilter {
            match &self.own {
                Some(filter) => filter,
                None => &OPEN,
            }
        }
    }

    static OPEN: Filter = Filter::open();

    fn deny_health() -> Arc<dyn DeliveryFilter> {
        Arc::new(FilterRule { excluded: vec!["/health".into()], ..Default::default() }.compile().unwrap())
    }

    #[tokio::test]
    async fn shared_filter_applies_to_plain_sinks() {
        let sink = Arc::new(Counting::default());
        let handler = FilterLayer::for_sink(&sink, deny_health()).layer(SinkHandler::new(sink.clone()));

        handler.handle(Arc::new(TraceEvent::new("GET", "/health"))).await.unwrap();
        handler.handle(Arc::new(TraceEvent::new("GET", "/orders"))).await.unwrap();

        assert_eq!(sink.traces.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn own_filter_replaces_shared_filter() {
        let own = FilterRule { included: vec!["/health".into()], ..Default::default() }.compile().unwrap();
        let sink = Arc::new(Counting { own: Some(own), ..Default::default() });
        let handler = FilterLayer::for_sink(&sink, deny_health()).layer(SinkHandler::new(sink.clone()));

        handler.handle(Arc::new(TraceEvent::new("GET", "/health"))).await.unwrap();
        handler.handle(Arc::new(TraceEvent::new("GET", "/orders"))).await.unwrap();

        assert_eq!(sink.traces.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sink_errors_surface_as_handler_errors() {
        let handler = SinkHandler::new(Arc::new(Counting::default()));
        let event = Arc::new(ErrorEvent::new(crate::event::ReportedError("x".into()), ""));
        let err = Handler::<ErrorEvent>::handle(&handler, event).await.unwrap_err();
        assert!(err.to_string().contains("offline"));
    }
}
