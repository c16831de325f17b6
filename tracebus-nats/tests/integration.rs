use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracebus::prelude::*;
use tracebus_nats::{Adaptor, BridgeSink, Delivery, NatsSettings, Publisher};

/// Publishes straight into an adaptor, standing in for the bus.
struct Loopback {
    adaptor: Adaptor,
    subjects: Mutex<Vec<String>>,
}

#[async_trait]
impl Publisher for Loopback {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), SinkError> {
        self.subjects.lock().unwrap().push(subject.to_string());
        self.adaptor.handle(subject, &payload);
        Ok(())
    }
}

fn collector() -> (Hub, Arc<MemorySink>) {
    let hub = Hub::new(HubConfig::default()).unwrap();
    let memory = Arc::new(MemorySink::new());
    hub.register_sink(memory.clone());
    hub.start();
    (hub, memory)
}

#[tokio::test]
async fn events_cross_the_bridge_into_the_remote_hub() {
    let settings = NatsSettings::default();
    let (remote, memory) = collector();
    let loopback = Arc::new(Loopback { adaptor: Adaptor::new(remote.clone(), &settings), subjects: Mutex::default() });
    let bridge = BridgeSink::new(loopback.clone(), &settings);

    let trace = TraceEvent::new("POST", "/orders?id=7")
        .with_status(201)
        .with_duration(Duration::from_millis(12))
        .with_bodies("{\"sku\":1}", "{\"ok\":true}");
    bridge.report_trace(&trace).await.unwrap();
    bridge.report_error(&ErrorEvent::new(ReportedError("db down".into()), "/orders")).await.unwrap();
    bridge
        .report_job_outcome(&JobOutcomeEvent::new("orders", "reindex", true, Duration::from_secs(3)))
        .await
        .unwrap();
    remote.shutdown().await;

    assert_eq!(
        *loopback.subjects.lock().unwrap(),
        vec!["monitor.tracing", "monitor.error", "monitor.schedule"]
    );
    let traces = memory.traces();
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].operation, "/orders");
    assert_eq!(traces[0].duration, Duration::from_millis(12));
    assert_eq!(traces[0].response_body, "{\"ok\":true}");
    assert_eq!(memory.errors()[0].message(), "db down");
    assert!(memory.job_outcomes()[0].succeed);
    assert_eq!(loopback.adaptor.stats().pushed, 3);
}

#[tokio::test]
async fn malformed_payloads_are_abandoned_not_retried() {
    let (remote, memory) = collector();
    let adaptor = Adaptor::new(remote.clone(), &NatsSettings::default());

    assert_eq!(adaptor.handle("monitor.tracing", b"{not json"), Delivery::Abandoned);
    assert_eq!(adaptor.handle("monitor.unknown", b"{}"), Delivery::Abandoned);
    assert_eq!(adaptor.handle("other.tracing", b"{}"), Delivery::Abandoned);
    remote.shutdown().await;

    assert_eq!(adaptor.stats().abandoned, 3);
    assert_eq!(adaptor.stats().pushed, 0);
    assert!(memory.is_empty());
}

#[tokio::test]
async fn full_hub_channel_reports_a_drop_not_a_push() {
    let remote = Hub::new(HubConfig { channel_capacity: 1, ..HubConfig::default() }).unwrap();
    let adaptor = Adaptor::new(remote.clone(), &NatsSettings::default());
    let payload = serde_json::to_vec(&TraceEvent::new("GET", "/orders")).unwrap();

    assert_eq!(adaptor.handle("monitor.tracing", &payload), Delivery::Pushed(EventKind::Trace));
    assert_eq!(adaptor.handle("monitor.tracing", &payload), Delivery::Dropped(EventKind::Trace));

    let stats = adaptor.stats();
    assert_eq!((stats.pushed, stats.dropped, stats.abandoned), (1, 1, 0));
    assert_eq!(remote.channel::<TraceEvent>().stats().dropped, 1);
    remote.shutdown().await;
}

#[test]
fn custom_prefix_changes_the_subscription() {
    let settings = NatsSettings::from_yaml_str("prefix: audit").unwrap();
    let hub = Hub::new(HubConfig::default()).unwrap();
    assert_eq!(Adaptor::new(hub, &settings).subscription(), "audit.*");
    assert_eq!(tracebus_nats::subject("audit", EventKind::Error), "audit.error");
}

// Requires NATS running and env TRACEBUS_TEST_NATS_URL set, e.g. nats://127.0.0.1:4222
#[cfg(feature = "client")]
#[tokio::test]
#[ignore]
async fn publishes_to_a_live_server() {
    use tracebus_nats::client::NatsPublisher;

    let url = std::env::var("TRACEBUS_TEST_NATS_URL").expect("set TRACEBUS_TEST_NATS_URL");
    let settings = NatsSettings { url: url.clone(), ..Default::default() };
    let listener = nats::asynk::connect(url.as_str()).await.expect("connect nats");
    let subscription = listener.subscribe("monitor.tracing").await.expect("subscribe");

    let bridge = BridgeSink::new(NatsPublisher::connect(&settings).await.expect("publisher"), &settings);
    bridge.report_trace(&TraceEvent::new("GET", "/live")).await.unwrap();

    let message = subscription.next().await.expect("message");
    let payload: serde_json::Value = serde_json::from_slice(&message.data).unwrap();
    assert_eq!(payload["uri"], "/live");
}
