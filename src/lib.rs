#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tracebus
//!
//! In-process fan-out of runtime telemetry (request traces, error reports and scheduled-job
//! outcomes) to independently configured sinks.
//!
//! ## Features
//!
//! - **Event channels**: one bounded queue per event kind; pushes never block and drops are counted
//! - **Named subscribers** dispatched in registration order, failures isolated per subscriber
//! - **Filters** with include/exclude globs over URI and client address, per sink or shared
//! - **Resilient delivery** primitives: bounded retry with backoff, per-attempt timeout, truncation
//! - **Batch writers** flushing by size or age into time-partitioned destinations
//!
//! Backends live in companion crates: `tracebus-loki`, `tracebus-prometheus`, `tracebus-jsonl`
//! and `tracebus-nats`.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tracebus::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let settings = Settings::from_yaml_str("filter:\n  excluded: ['/health']\n").unwrap();
//!     let hub = Hub::from_settings(&settings).unwrap();
//!     hub.register_sink(Arc::new(ConsoleSink::new()));
//!     hub.start();
//!
//!     hub.push_trace(TraceEvent::new("GET", "/api/orders?page=1").with_status(200));
//!     hub.shutdown().await;
//! }
//! ```

pub mod backoff;
pub mod batch;
pub mod channel;
pub mod error;
pub mod event;
pub mod filter;
pub mod hub;
pub mod prelude;
pub mod retry;
pub mod settings;
pub mod sink;
pub mod sinks;
pub mod sleeper;
pub mod timeout;
pub mod truncate;

// Re-exports
pub use backoff::Backoff;
pub use batch::{Batch, BatchConfig, BatchDestination, BatchWriter};
pub use channel::{handler_fn, ChannelStats, EventChannel, Handler};
pub use error::{ConfigError, PushError, ResilienceError, SinkError};
pub use event::{ErrorEvent, ErrorRecord, Event, EventKind, JobOutcomeEvent, ReportedError, TraceEvent};
pub use filter::{DeliveryFilter, Filter, FilterRule};
pub use hub::{Hub, HubConfig};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use settings::{ProcessIdentity, Settings};
pub use sink::{FilterableSink, Sink};
pub use sinks::{ConsoleSink, MemorySink, RecordStore, RequestRecord, StoreSink};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use timeout::TimeoutPolicy;
