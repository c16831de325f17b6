//! Prometheus metrics sink for `tracebus`.
//! Bring your own `prometheus::Registry`; collectors are registered once and updated per event.

use async_trait::async_trait;
use prometheus::{exponential_buckets, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;
use tracebus::error::{ConfigError, SinkError};
use tracebus::event::{ErrorEvent, JobOutcomeEvent, TraceEvent};
use tracebus::sink::Sink;

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    requests: IntCounterVec,
    request_duration: HistogramVec,
    request_size: HistogramVec,
    response_size: HistogramVec,
    errors: IntCounter,
    jobs: IntCounterVec,
    job_duration: HistogramVec,
}

impl PrometheusSink {
    /// Create a sink and register its collectors into the provided registry.
    ///
    /// # Errors
    /// Fails if a collector cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, ConfigError> {
        Self::build(registry.into()).map_err(|e| ConfigError::Client(format!("prometheus: {e}")))
    }

    fn build(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let requests = IntCounterVec::new(
            Opts::new("tracebus_requests_total", "Traced requests"),
            &["operation", "method", "status"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new("tracebus_request_duration_seconds", "Traced request latency"),
            &["operation", "method"],
        )?;
        let size_buckets = exponential_buckets(64.0, 4.0, 8)?;
        let request_size = HistogramVec::new(
            HistogramOpts::new("tracebus_request_size_bytes", "Request body size")
                .buckets(size_buckets.clone()),
            &["operation", "method"],
        )?;
        let response_size = HistogramVec::new(
            HistogramOpts::new("tracebus_response_size_bytes", "Response body size").buckets(size_buckets),
            &["operation", "method"],
        )?;
        let errors = IntCounter::new("tracebus_errors_total", "Reported errors")?;
        let jobs = IntCounterVec::new(
            Opts::new("tracebus_jobs_total", "Scheduled job completions"),
            &["app", "job", "outcome"],
        )?;
        let job_duration = HistogramVec::new(
            HistogramOpts::new("tracebus_job_duration_seconds", "Scheduled job run time"),
            &["app", "job"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(request_size.clone()))?;
        registry.register(Box::new(response_size.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(jobs.clone()))?;
        registry.register(Box::new(job_duration.clone()))?;

        Ok(Self { registry, requests, request_duration, request_size, response_size, errors, jobs, job_duration })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn metric_error(e: prometheus::Error) -> SinkError {
    SinkError::Other(Box::new(e))
}

#[async_trait]
impl Sink for PrometheusSink {
    async fn report_trace(&self, event: &TraceEvent) -> Result<(), SinkError> {
        let status = event.status.to_string();
        let route = [event.operation.as_str(), event.method.as_str()];
        self.requests
            .get_metric_with_label_values(&[route[0], route[1], &status])
            .map_err(metric_error)?
            .inc();
        self.request_duration
            .get_metric_with_label_values(&route)
            .map_err(metric_error)?
            .observe(event.duration.as_secs_f64());
        self.request_size
            .get_metric_with_label_values(&route)
            .map_err(metric_error)?
            .observe(event.request_body.len() as f64);
        self.response_size
            .get_metric_with_label_values(&route)
            .map_err(metric_error)?
            .observe(event.response_body.len() as f64);
        Ok(())
    }

    async fn report_error(&self, _event: &ErrorEvent) -> Result<(), SinkError> {
        self.errors.inc();
        Ok(())
    }

    async fn report_job_outcome(&self, event: &JobOutcomeEvent) -> Result<(), SinkError> {
        self.jobs
            .get_metric_with_label_values(&[&event.app, &event.job, event.outcome()])
            .map_err(metric_error)?
            .inc();
        self.job_duration
            .get_metric_with_label_values(&[&event.app, &event.job])
            .map_err(metric_error)?
            .observe(event.duration.as_secs_f64());
        Ok(())
    }
}
