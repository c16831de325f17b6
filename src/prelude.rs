//! Convenient re-exports for wiring a hub and writing sinks.
pub use crate::{
    batch::{Batch, BatchConfig, BatchDestination, BatchWriter},
    channel::{handler_fn, EventChannel, Handler},
    error::{ConfigError, SinkError},
    event::{ErrorEvent, Event, EventKind, JobOutcomeEvent, ReportedError, TraceEvent},
    filter::{DeliveryFilter, Filter, FilterRule},
    hub::{Hub, HubConfig},
    settings::{ProcessIdentity, Settings},
    sink::{FilterableSink, Sink},
    sinks::{ConsoleSink, MemorySink},
};
