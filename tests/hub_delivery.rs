use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracebus::prelude::*;
use tracebus::sinks::{RecordStore, RequestRecord, StoreSink};
use tower::BoxError;

fn trace(uri: &str) -> TraceEvent {
    TraceEvent::new("GET", uri).with_status(200).with_client_ip("10.0.0.7")
}

fn hub_excluding(pattern: &str) -> Hub {
    Hub::new(HubConfig {
        default_filter: FilterRule { excluded: vec![pattern.into()], ..Default::default() },
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn sinks_without_their_own_filter_use_the_default() {
    let hub = hub_excluding("/health");
    let plain = Arc::new(MemorySink::new());
    hub.register_sink(plain.clone());
    hub.start();

    hub.push_trace(trace("/health"));
    hub.push_trace(trace("/api/orders"));
    hub.shutdown().await;

    let uris: Vec<_> = plain.traces().into_iter().map(|t| t.uri).collect();
    assert_eq!(uris, vec!["/api/orders"]);
}

#[tokio::test]
async fn a_sink_filter_replaces_the_default() {
    let hub = hub_excluding("/health");
    let own = FilterRule { included: vec!["/health".into()], ..Default::default() }.compile().unwrap();
    let watcher = Arc::new(MemorySink::new().with_filter(own));
    hub.register_sink(watcher.clone());
    hub.register_sink(Arc::new(ConsoleSink::new()));
    hub.start();

    hub.push_trace(trace("/health"));
    hub.push_trace(trace("/api/orders"));
    hub.shutdown().await;

    let uris: Vec<_> = watcher.traces().into_iter().map(|t| t.uri).collect();
    assert_eq!(uris, vec!["/health"]);
}

#[tokio::test]
async fn filters_do_not_apply_to_errors_or_job_outcomes() {
    let hub = hub_excluding("/**");
    let memory = Arc::new(MemorySink::new());
    hub.register_sink(memory.clone());
    hub.start();

    hub.push_trace(trace("/anything"));
    hub.report_error(&std::io::Error::other("disk full"), "/anything");
    hub.push_job_outcome(JobOutcomeEvent::new("orders", "nightly", false, Duration::from_secs(9)));
    hub.shutdown().await;

    assert!(memory.traces().is_empty());
    assert_eq!(memory.errors().len(), 1);
    assert_eq!(memory.job_outcomes().len(), 1);
}

#[tokio::test]
async fn failed_construction_is_skipped() {
    let hub = Hub::new(HubConfig::default()).unwrap();
    let broken: Result<MemorySink, ConfigError> = Err(ConfigError::Client("unreachable".into()));
    assert!(!hub.try_register(broken));
    assert!(hub.channel::<TraceEvent>().receivers().is_empty());
    assert!(hub.try_register(Ok(MemorySink::new())));
    assert_eq!(hub.channel::<ErrorEvent>().receivers().len(), 1);
}

#[derive(Default)]
struct FlakyStore {
    saved: Mutex<Vec<RequestRecord>>,
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn save(&self, record: RequestRecord) -> Result<(), BoxError> {
        if record.uri.starts_with("/reject") {
            return Err("constraint violation".into());
        }
        self.saved.lock().unwrap().push(record);
        Ok(())
    }
}

#[tokio::test]
async fn store_failures_are_counted_without_stopping_the_channel() {
    let hub = Hub::new(HubConfig::default()).unwrap();
    let store = Arc::new(StoreSink::new(FlakyStore::default()));
    hub.register_sink(store.clone());
    hub.start();

    hub.push_trace(trace("/reject/1"));
    hub.push_trace(trace("/api/1"));
    hub.shutdown().await;

    assert_eq!(store.store().saved.lock().unwrap().len(), 1);
    let stats = hub.stats(EventKind::Trace);
    assert_eq!((stats.failed, stats.delivered), (1, 1));
}
