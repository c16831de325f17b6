//! Bounded, in-memory fan-out of one event kind to named subscribers.
//!
//! Producers call [`EventChannel::push`], which never waits: the event goes into a bounded
//! queue or, when the queue is full, is dropped and counted. A single dispatch task drains the
//! queue and hands each event to every subscriber in registration order, awaiting each handler
//! before moving on. That keeps per-subscriber order equal to push order. Handlers doing slow
//! I/O should hand off into their own buffer instead of blocking the loop.
//!
//! A failing (or panicking) handler is logged and counted; the remaining subscribers still
//! receive the event.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tracebus::channel::{handler_fn, EventChannel};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let channel = EventChannel::<u64>::new("numbers", 1024);
//! channel.subscribe("printer", handler_fn(|n: Arc<u64>| async move {
//!     println!("got {n}");
//!     Ok(())
//! }));
//! channel.start();
//! channel.push(7);
//! channel.stop(Duration::from_secs(1)).await;
//! assert_eq!(channel.stats().delivered, 1);
//! # });
//! ```

use crate::error::PushError;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tower::BoxError;

/// Default queue size per channel.
pub const DEFAULT_CAPACITY: usize = 32_767;

/// Receives every event pushed to the channel it is subscribed to.
#[async_trait]
pub trait Handler<T>: Send + Sync + 'static {
    async fn handle(&self, event: Arc<T>) -> Result<(), BoxError>;
}

#[async_trait]
impl<T, H> Handler<T> for Arc<H>
where
    T: Send + Sync + 'static,
    H: Handler<T> + ?Sized,
{
    async fn handle(&self, event: Arc<T>) -> Result<(), BoxError> {
        (**self).handle(event).await
    }
}

/// Adapts an async closure into a [`Handler`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

pub fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn { f }
}

#[async_trait]
impl<T, F, Fut> Handler<T> for HandlerFn<F>
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn handle(&self, event: Arc<T>) -> Result<(), BoxError> {
        (self.f)(event).await
    }
}

struct Subscriber<T> {
    name: String,
    handler: Arc<dyn Handler<T>>,
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self { name: self.name.clone(), handler: Arc::clone(&self.handler) }
    }
}

/// Snapshot of a channel's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Events refused at push time (queue full or channel stopped) or discarded at stop.
    pub dropped: u64,
    /// Successful handler invocations.
    pub delivered: u64,
    /// Handler invocations that returned an error or panicked.
    pub failed: u64,
    /// Events currently waiting in the queue.
    pub queued: usize,
}

struct Shared<T> {
    name: &'static str,
    tx: mpsc::Sender<Arc<T>>,
    rx: Mutex<Option<mpsc::Receiver<Arc<T>>>>,
    subscribers: ArcSwap<Vec<Subscriber<T>>>,
    stop: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Fan-out channel for one event kind. Cloning yields another handle to the same channel.
pub struct EventChannel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for EventChannel<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T> std::fmt::Debug for EventChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscribers = self.shared.subscribers.load();
        let names: Vec<&str> = subscribers.iter().map(|s| s.name.as_str()).collect();
        f.debug_struct("EventChannel").field("name", &self.shared.name).field("subscribers", &names).finish()
    }
}

impl<T> EventChannel<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (stop, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                name,
                tx,
                rx: Mutex::new(Some(rx)),
                subscribers: ArcSwap::from_pointee(Vec::new()),
                stop,
                worker: Mutex::new(None),
                dropped: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Fire-and-forget push. Never blocks; a refused event is counted and logged.
    pub fn push(&self, event: T) {
        let _ = self.try_push(event);
    }

    /// Push and report whether the event was queued.
    pub fn try_push(&self, event: T) -> Result<(), PushError> {
        let err = match self.shared.tx.try_send(Arc::new(event)) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => PushError::Full(self.shared.name),
            Err(mpsc::error::TrySendError::Closed(_)) => PushError::Closed(self.shared.name),
        };
        let total = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if total == 1 || total % 1024 == 0 {
            tracing::warn!(channel = self.shared.name, dropped = total, error = %err, "event dropped");
        }
        Err(err)
    }

    /// Register `handler` under `name`. Re-using a name replaces the earlier handler in place,
    /// keeping its position in the dispatch order. Returns `true` when a handler was replaced.
    pub fn subscribe<H>(&self, name: impl Into<String>, handler: H) -> bool
    where
        H: Handler<T>,
    {
        let name = name.into();
        let handler: Arc<dyn Handler<T>> = Arc::new(handler);
        let mut replaced = false;
        self.shared.subscribers.rcu(|current| {
            let mut next = Vec::clone(current);
            replaced = match next.iter_mut().find(|s| s.name == name) {
                Some(existing) => {
                    existing.handler = Arc::clone(&handler);
                    true
                }
                None => {
                    next.push(Subscriber { name: name.clone(), handler: Arc::clone(&handler) });
                    false
                }
            };
            next
        });
        tracing::debug!(channel = self.shared.name, subscriber = %name, replaced, "subscribed");
        replaced
    }

    pub fn unsubscribe(&self, name: &str) -> bool {
        let mut removed = false;
        self.shared.subscribers.rcu(|current| {
            let mut next = Vec::clone(current);
            let before = next.len();
            next.retain(|s| s.name != name);
            removed = next.len() != before;
            next
        });
        removed
    }

    /// Subscriber names in dispatch order.
    pub fn receivers(&self) -> Vec<String> {
        self.shared.subscribers.load().iter().map(|s| s.name.clone()).collect()
    }

    pub fn stats(&self) -> ChannelStats {
        let tx = &self.shared.tx;
        ChannelStats {
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            queued: tx.max_capacity() - tx.capacity(),
        }
    }

    /// Spawn the dispatch loop. Must run inside a tokio runtime; returns `false` if the
    /// channel was already started (or stopped).
    pub fn start(&self) -> bool {
        let Some(rx) = lock(&self.shared.rx).take() else {
            tracing::warn!(channel = self.shared.name, "channel already started");
            return false;
        };
        let shared = Arc::clone(&self.shared);
        let stop = self.shared.stop.subscribe();
        let handle = tokio::spawn(dispatch_loop(shared, rx, stop));
        *lock(&self.shared.worker) = Some(handle);
        tracing::info!(channel = self.shared.name, subscribers = ?self.receivers(), "channel started");
        true
    }

    /// Stop accepting events, deliver what is still queued, and wait for the loop to finish,
    /// giving up after `drain_timeout`.
    pub async fn stop(&self, drain_timeout: Duration) {
        let _ = self.shared.stop.send(true);
        let handle = lock(&self.shared.worker).take();
        let Some(handle) = handle else {
            // never started: refuse further pushes and account for what was waiting
            if let Some(mut rx) = lock(&self.shared.rx).take() {
                rx.close();
                let mut discarded = 0u64;
                while rx.try_recv().is_ok() {
                    discarded += 1;
                }
                self.discard(discarded, "channel stopped before start; queued events discarded");
            }
            return;
        };
        let abort = handle.abort_handle();
        match tokio::time::timeout(drain_timeout, handle).await {
            Ok(Ok(())) => {
                tracing::info!(channel = self.shared.name, stats = ?self.stats(), "channel stopped")
            }
            Ok(Err(e)) => tracing::error!(channel = self.shared.name, error = %e, "dispatch task failed"),
            Err(_) => {
                let queued = self.stats().queued as u64;
                abort.abort();
                self.discard(queued, "drain timed out; queued events discarded");
                tracing::warn!(
                    channel = self.shared.name,
                    timeout = ?drain_timeout,
                    stats = ?self.stats(),
                    "drain timed out; dispatch aborted"
                );
            }
        }
    }
}

impl<T> EventChannel<T> {
    fn discard(&self, count: u64, message: &'static str) {
        if count == 0 {
            return;
        }
        let total = self.shared.dropped.fetch_add(count, Ordering::Relaxed) + count;
        tracing::warn!(channel = self.shared.name, discarded = count, dropped = total, "{}", message);
    }
}

impl<T> Shared<T>
where
    T: Send + Sync + 'static,
{
    async fn dispatch(&self, event: Arc<T>) {
        let subscribers = self.subscribers.load_full();
        for subscriber in subscribers.iter() {
            let outcome = AssertUnwindSafe(subscriber.handler.handle(Arc::clone(&event)))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(error)) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        channel = self.name,
                        subscriber = %subscriber.name,
                        error = %error,
                        "subscriber failed to handle event"
                    );
                }
                Err(_) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(channel = self.name, subscriber = %subscriber.name, "subscriber panicked");
                }
            }
        }
    }
}

async fn dispatch_loop<T>(
    shared: Arc<Shared<T>>,
    mut rx: mpsc::Receiver<Arc<T>>,
    mut stop: watch::Receiver<bool>,
) where
    T: Send + Sync + 'static,
{
    loop {
        tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            next = rx.recv() => match next {
                Some(event) => shared.dispatch(event).await,
                None => break,
            },
        }
    }

    rx.close();
    while let Ok(event) = rx.try_recv() {
        shared.dispatch(event).await;
    }
}

fn lock<V>(mutex: &Mutex<V>) -> std::sync::MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
