//! NATS bridge for `tracebus` (optional companion crate).
//!
//! [`BridgeSink`] publishes every event as JSON on a per-kind subject. [`Adaptor`] is the
//! other end: it decodes those subjects and pushes the events into a local [`Hub`], so a
//! collector process can fan them out to its own sinks.
//!
//! The default build carries no client; enable `client` for the NATS transport.
//!
//! ```toml
//! tracebus-nats = { version = "0.3", features = ["client"] }
//! ```

mod settings;

#[cfg(feature = "client")]
pub mod client;

pub use settings::{NatsSettings, DEFAULT_PREFIX, DEFAULT_QUEUE_GROUP};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracebus::error::{PushError, SinkError};
use tracebus::event::{ErrorEvent, EventKind, JobOutcomeEvent, TraceEvent};
use tracebus::hub::{Hub, Routed};
use tracebus::sink::Sink;

/// Message bus the bridge publishes through.
#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), SinkError>;
}

#[async_trait]
impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), SinkError> {
        (**self).publish(subject, payload).await
    }
}

/// `<prefix>.<kind>`
pub fn subject(prefix: &str, kind: EventKind) -> String {
    format!("{prefix}.{}", kind.as_str())
}

#[derive(Debug, Clone)]
pub struct BridgeSink<P> {
    publisher: P,
    prefix: String,
}

impl<P: Publisher> BridgeSink<P> {
    pub fn new(publisher: P, settings: &NatsSettings) -> Self {
        Self { publisher, prefix: settings.prefix.clone() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn forward<T: Serialize>(&self, kind: EventKind, event: &T) -> Result<(), SinkError> {
        let payload = serde_json::to_vec(event)?;
        self.publisher.publish(&subject(&self.prefix, kind), payload).await
    }
}

#[async_trait]
impl<P: Publisher> Sink for BridgeSink<P> {
    async fn report_trace(&self, event: &TraceEvent) -> Result<(), SinkError> {
        self.forward(EventKind::Trace, event).await
    }

    async fn report_error(&self, event: &ErrorEvent) -> Result<(), SinkError> {
        self.forward(EventKind::Error, event).await
    }

    async fn report_job_outcome(&self, event: &JobOutcomeEvent) -> Result<(), SinkError> {
        self.forward(EventKind::JobOutcome, event).await
    }
}

/// What the adaptor did with one message. Every outcome is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Pushed(EventKind),
    /// Decoded, but the hub channel was full or closed.
    Dropped(EventKind),
    Abandoned,
}

#[derive(Debug, Default)]
struct Counters {
    pushed: AtomicU64,
    dropped: AtomicU64,
    abandoned: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdaptorStats {
    pub pushed: u64,
    pub dropped: u64,
    pub abandoned: u64,
}

/// Replays bridged events into a local hub.
#[derive(Clone)]
pub struct Adaptor {
    hub: Hub,
    prefix: String,
    counters: Arc<Counters>,
}

impl Adaptor {
    pub fn new(hub: Hub, settings: &NatsSettings) -> Self {
        Self { hub, prefix: settings.prefix.clone(), counters: Arc::default() }
    }

    /// Wildcard subject covering every kind.
    pub fn subscription(&self) -> String {
        format!("{}.*", self.prefix)
    }

    pub fn stats(&self) -> AdaptorStats {
        AdaptorStats {
            pushed: self.counters.pushed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
        }
    }

    /// Decode one message and push it into the hub. Malformed payloads are abandoned;
    /// events the hub refuses are counted as dropped.
    pub fn handle(&self, subject: &str, payload: &[u8]) -> Delivery {
        match self.decode(subject, payload) {
            Ok((kind, Ok(()))) => {
                self.counters.pushed.fetch_add(1, Ordering::Relaxed);
                Delivery::Pushed(kind)
            }
            Ok((kind, Err(error))) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(subject, kind = kind.as_str(), dropped, %error, "hub refused bridged event");
                Delivery::Dropped(kind)
            }
            Err(reason) => {
                let abandoned = self.counters.abandoned.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(subject, bytes = payload.len(), abandoned, error = %reason, "abandoning bridged message");
                Delivery::Abandoned
            }
        }
    }

    fn decode(&self, subject: &str, payload: &[u8]) -> Result<(EventKind, Result<(), PushError>), String> {
        let suffix = subject
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .ok_or_else(|| format!("subject outside `{}`", self.prefix))?;
        let kind = EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == suffix)
            .ok_or_else(|| format!("unknown event kind `{suffix}`"))?;
        let pushed = match kind {
            EventKind::Trace => self.route::<TraceEvent>(payload)?,
            EventKind::Error => self.route::<ErrorEvent>(payload)?,
            EventKind::JobOutcome => self.route::<JobOutcomeEvent>(payload)?,
        };
        Ok((kind, pushed))
    }

    fn route<E: Routed + DeserializeOwned>(&self, payload: &[u8]) -> Result<Result<(), PushError>, String> {
        let event: E = serde_json::from_slice(payload).map_err(|e| e.to_string())?;
        Ok(self.hub.channel::<E>().try_push(event))
    }
}

impl std::fmt::Debug for Adaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adaptor").field("prefix", &self.prefix).field("stats", &self.stats()).finish()
    }
}
