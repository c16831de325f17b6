//! Wire a hub from YAML settings, attach the console and memory sinks, and push a few events.
//!
//! Run with `RUST_LOG=debug cargo run --example console_fanout`.

use std::sync::Arc;
use std::time::Duration;
use tracebus::prelude::*;
use tracing_subscriber::EnvFilter;

const SETTINGS: &str = r#"
channel_capacity: 1024
drain_timeout_ms: 2000
filter:
  excluded: ["/health", "/metrics"]
console:
  enabled: true
  request: true
  response: true
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let settings = Settings::from_yaml_str(SETTINGS)?;
    let hub = Hub::from_settings(&settings)?;
    if settings.console.enabled {
        hub.register_sink(Arc::new(
            ConsoleSink::new().with_bodies(settings.console.request, settings.console.response),
        ));
    }
    let memory = Arc::new(MemorySink::with_capacity(100));
    hub.register_sink(memory.clone());
    hub.start();

    hub.push_trace(TraceEvent::new("GET", "/health").with_status(200));
    hub.push_trace(
        TraceEvent::new("POST", "/api/orders?dry_run=1")
            .with_status(201)
            .with_duration(Duration::from_millis(37))
            .with_client_ip("10.1.2.3")
            .with_bodies(r#"{"sku":"A-1","qty":2}"#, r#"{"id":991}"#),
    );
    hub.push_trace(TraceEvent::outbound("GET", "https://billing.internal/v1/invoices/991").with_status(503));
    hub.report_error(&std::io::Error::other("billing unavailable"), "/api/orders");
    hub.push_job_outcome(JobOutcomeEvent::new("orders", "nightly-reindex", true, Duration::from_secs(42)));

    hub.shutdown().await;
    println!(
        "recorded {} traces, {} errors, {} job outcomes",
        memory.traces().len(),
        memory.errors().len(),
        memory.job_outcomes().len()
    );
    Ok(())
}
