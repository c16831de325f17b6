//! Size/age bounded batching in front of a durable destination.
//!
//! A [`BatchWriter`] subscribes to one channel. Events are forwarded to a task that owns the
//! buffer; the channel's dispatch loop never touches it. The task flushes when
//! `max_size` items have arrived since the last flush attempt, or when the oldest of them is
//! `max_age` old.
//!
//! A failed flush keeps the batch and tries again at the next threshold: delivery is
//! at-least-once. Without `max_buffered` the buffer grows for as long as the destination is
//! down; with it, the oldest items are dropped and counted.

use crate::channel::Handler;
use crate::error::{ConfigError, SinkError};
use crate::event::Event;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower::BoxError;

/// One flush unit handed to a [`BatchDestination`].
#[derive(Debug, Clone)]
pub struct Batch {
    /// Relative path without extension: `<sub_path>/<YYYYMMDD>/<HHMMSS>-<8 hex>`.
    pub partition: PathBuf,
    pub records: Vec<Value>,
    pub created_at: DateTime<Utc>,
}

/// Durable storage for flushed batches.
#[async_trait]
pub trait BatchDestination: Send + Sync + 'static {
    async fn write(&self, batch: &Batch) -> Result<(), SinkError>;
}

#[async_trait]
impl<D> BatchDestination for Arc<D>
where
    D: BatchDestination + ?Sized,
{
    async fn write(&self, batch: &Batch) -> Result<(), SinkError> {
        (**self).write(batch).await
    }
}

/// Thresholds and naming for one writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_size: usize,
    pub max_age: Duration,
    /// First path segment of every partition, usually the event kind's archive name.
    pub sub_path: String,
    /// Drop the oldest items once this many are retained.
    pub max_buffered: Option<usize>,
}

impl BatchConfig {
    pub fn new(sub_path: impl Into<String>) -> Self {
        Self {
            max_size: 1000,
            max_age: Duration::from_secs(30),
            sub_path: sub_path.into(),
            max_buffered: None,
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_max_buffered(mut self, limit: usize) -> Self {
        self.max_buffered = Some(limit);
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::Invalid { key: "max_size", reason: "must be > 0".into() });
        }
        if self.max_age.is_zero() {
            return Err(ConfigError::Invalid { key: "max_age", reason: "must be > 0".into() });
        }
        if let Some(limit) = self.max_buffered {
            if limit < self.max_size {
                return Err(ConfigError::Invalid {
                    key: "max_buffered",
                    reason: format!("{limit} is below max_size {}", self.max_size),
                });
            }
        }
        Ok(())
    }
}

/// `<sub_path>/<YYYYMMDD>/<HHMMSS>-<8 hex>`
pub fn partition_path(sub_path: &str, at: DateTime<Utc>) -> PathBuf {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let mut path = PathBuf::from(sub_path);
    path.push(at.format("%Y%m%d").to_string());
    path.push(format!("{}-{}", at.format("%H%M%S"), &suffix[..8]));
    path
}

/// The in-memory accumulator owned by a writer task.
#[derive(Debug)]
pub struct BatchBuffer<R> {
    items: VecDeque<R>,
    /// Items appended since the last flush attempt.
    fresh: usize,
    /// When the age clock started: first item since the last attempt, or the failed attempt.
    since: Option<Instant>,
    max_size: usize,
    max_age: Duration,
    max_buffered: Option<usize>,
    dropped: u64,
}

impl<R> BatchBuffer<R> {
    pub fn new(max_size: usize, max_age: Duration, max_buffered: Option<usize>) -> Self {
        Self {
            items: VecDeque::new(),
            fresh: 0,
            since: None,
            max_size: max_size.max(1),
            max_age,
            max_buffered,
            dropped: 0,
        }
    }

    /// Append one item; returns `true` once the size threshold is reached.
    pub fn push(&mut self, item: R, now: Instant) -> bool {
        self.items.push_back(item);
        self.fresh += 1;
        self.since.get_or_insert(now);
        if let Some(limit) = self.max_buffered {
            while self.items.len() > limit {
                self.items.pop_front();
                self.dropped += 1;
            }
        }
        self.size_due()
    }

    pub fn size_due(&self) -> bool {
        self.fresh >= self.max_size
    }

    pub fn age_due(&self, now: Instant) -> bool {
        !self.items.is_empty()
            && self.since.is_some_and(|since| now.saturating_duration_since(since) >= self.max_age)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items discarded by the `max_buffered` valve.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Remove up to `max_size` of the oldest items.
    pub fn take_chunk(&mut self) -> Vec<R> {
        let n = self.items.len().min(self.max_size);
        self.items.drain(..n).collect()
    }

    /// Put an unwritten chunk back in front, preserving order.
    pub fn restore(&mut self, chunk: Vec<R>) {
        for item in chunk.into_iter().rev() {
            self.items.push_front(item);
        }
    }

    /// Reset both thresholds after a flush attempt.
    pub fn mark_attempt(&mut self, now: Instant) {
        self.fresh = 0;
        self.since = if self.items.is_empty() { None } else { Some(now) };
    }
}

/// Counters shared between a writer handle and its task.
#[derive(Debug, Default)]
pub struct WriterStats {
    flushes: AtomicU64,
    flushed_records: AtomicU64,
    failures: AtomicU64,
    dropped: AtomicU64,
    buffered: AtomicU64,
}

impl WriterStats {
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn flushed_records(&self) -> u64 {
        self.flushed_records.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Items retained after the last buffer change.
    pub fn buffered(&self) -> u64 {
        self.buffered.load(Ordering::Relaxed)
    }
}

type Transform<E, R> = Arc<dyn Fn(&E) -> R + Send + Sync>;
type BatchFilter<R> = Arc<dyn Fn(&R) -> bool + Send + Sync>;

/// Configures and spawns a [`BatchWriter`].
pub struct BatchWriterBuilder<E, R> {
    config: BatchConfig,
    destination: Arc<dyn BatchDestination>,
    transform: Transform<E, R>,
    batch_filter: Option<BatchFilter<R>>,
}

impl<E, R> BatchWriterBuilder<E, R>
where
    E: Event,
    R: Serialize + Send + 'static,
{
    /// Persist a different record shape than the event itself.
    pub fn transform<R2, F>(self, f: F) -> BatchWriterBuilder<E, R2>
    where
        F: Fn(&E) -> R2 + Send + Sync + 'static,
    {
        BatchWriterBuilder {
            config: self.config,
            destination: self.destination,
            transform: Arc::new(f),
            batch_filter: None,
        }
    }

    /// Keep only the records for which `f` returns `true` when a chunk is written.
    pub fn batch_filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.batch_filter = Some(Arc::new(f));
        self
    }

    /// Validate the configuration and start the owner task. Must run inside a tokio runtime.
    pub fn spawn(self) -> Result<BatchWriter<E>, ConfigError> {
        self.config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(WriterStats::default());
        let task = WriterTask {
            name: self.config.sub_path.clone(),
            buffer: BatchBuffer::new(self.config.max_size, self.config.max_age, self.config.max_buffered),
            destination: self.destination,
            transform: self.transform,
            batch_filter: self.batch_filter,
            stats: Arc::clone(&stats),
            sub_path: self.config.sub_path.clone(),
        };
        let tick = self.config.max_age.min(Duration::from_secs(1));
        let handle = tokio::spawn(task.run(rx, tick));
        tracing::info!(
            writer = %self.config.sub_path,
            max_size = self.config.max_size,
            max_age = ?self.config.max_age,
            "batch writer started"
        );
        Ok(BatchWriter {
            inner: Arc::new(WriterHandle {
                name: self.config.sub_path,
                tx,
                worker: Mutex::new(Some(handle)),
                stats,
            }),
        })
    }
}

enum Command<E> {
    Event(Arc<E>),
    Flush(oneshot::Sender<bool>),
    Shutdown,
}

struct WriterHandle<E> {
    name: String,
    tx: mpsc::UnboundedSender<Command<E>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<WriterStats>,
}

/// Handle to a running batch writer. Subscribe it to the channel of its event kind.
pub struct BatchWriter<E> {
    inner: Arc<WriterHandle<E>>,
}

impl<E> Clone for BatchWriter<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<E> std::fmt::Debug for BatchWriter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWriter").field("name", &self.inner.name).field("stats", &self.inner.stats).finish()
    }
}

impl<E> BatchWriter<E>
where
    E: Event + Clone + Serialize,
{
    /// Writer persisting events as they are.
    pub fn builder<D>(config: BatchConfig, destination: D) -> BatchWriterBuilder<E, E>
    where
        D: BatchDestination,
    {
        BatchWriterBuilder {
            config,
            destination: Arc::new(destination),
            transform: Arc::new(E::clone),
            batch_filter: None,
        }
    }
}

impl<E> BatchWriter<E>
where
    E: Event,
{
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn stats(&self) -> &WriterStats {
        &self.inner.stats
    }

    /// Queue an event for the next batch.
    pub fn append(&self, event: Arc<E>) -> Result<(), SinkError> {
        self.inner
            .tx
            .send(Command::Event(event))
            .map_err(|_| SinkError::transport(format!("batch writer `{}` stopped", self.inner.name)))
    }

    /// Flush everything buffered now; `true` when every chunk was written.
    pub async fn flush(&self) -> bool {
        let (ack, done) = oneshot::channel();
        if self.inner.tx.send(Command::Flush(ack)).is_err() {
            return false;
        }
        done.await.unwrap_or(false)
    }

    /// Flush what is left and stop the task, waiting at most `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        let _ = self.inner.tx.send(Command::Shutdown);
        let handle = self.inner.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(handle) = handle else {
            return;
        };
        let abort = handle.abort_handle();
        if tokio::time::timeout(timeout, handle).await.is_err() {
            abort.abort();
            tracing::warn!(
                writer = %self.inner.name,
                buffered = self.inner.stats.buffered(),
                "batch writer did not finish its final flush in time"
            );
        }
    }
}

#[async_trait]
impl<E> Handler<E> for BatchWriter<E>
where
    E: Event,
{
    async fn handle(&self, event: Arc<E>) -> Result<(), BoxError> {
        self.append(event).map_err(Into::into)
    }
}

/// Type-erased shutdown so a hub can own writers of different kinds.
#[async_trait]
pub trait Drain: Send + Sync {
    fn name(&self) -> &str;
    async fn shutdown(&self, timeout: Duration);
}

#[async_trait]
impl<E> Drain for BatchWriter<E>
where
    E: Event,
{
    fn name(&self) -> &str {
        BatchWriter::name(self)
    }

    async fn shutdown(&self, timeout: Duration) {
        BatchWriter::shutdown(self, timeout).await
    }
}

struct WriterTask<E, R> {
    name: String,
    buffer: BatchBuffer<R>,
    destination: Arc<dyn BatchDestination>,
    transform: Transform<E, R>,
    batch_filter: Option<BatchFilter<R>>,
    stats: Arc<WriterStats>,
    sub_path: String,
}

impl<E, R> WriterTask<E, R>
where
    E: Event,
    R: Serialize + Send + 'static,
{
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command<E>>, tick: Duration) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Event(event)) => {
                        let record = (self.transform)(&event);
                        let before = self.buffer.dropped();
                        if self.buffer.push(record, Instant::now()) {
                            self.flush().await;
                        }
                        self.note_dropped(before);
                    }
                    Some(Command::Flush(ack)) => {
                        let ok = self.flush().await;
                        let _ = ack.send(ok);
                    }
                    Some(Command::Shutdown) | None => break,
                },
                _ = ticker.tick() => {
                    if self.buffer.age_due(Instant::now()) {
                        self.flush().await;
                    }
                }
            }
            self.stats.buffered.store(self.buffer.len() as u64, Ordering::Relaxed);
        }

        // everything queued behind the shutdown request belongs in the final batch;
        // pending flush requests are answered with its outcome
        rx.close();
        let mut waiting = Vec::new();
        while let Ok(command) = rx.try_recv() {
            match command {
                Command::Event(event) => {
                    let record = (self.transform)(&event);
                    let before = self.buffer.dropped();
                    self.buffer.push(record, Instant::now());
                    self.note_dropped(before);
                }
                Command::Flush(ack) => waiting.push(ack),
                Command::Shutdown => {}
            }
        }
        let ok = self.buffer.is_empty() || self.flush().await;
        if !ok {
            tracing::error!(
                writer = %self.name,
                lost = self.buffer.len(),
                "final flush failed; buffered records discarded"
            );
        }
        for ack in waiting {
            let _ = ack.send(ok);
        }
        self.stats.buffered.store(self.buffer.len() as u64, Ordering::Relaxed);
        tracing::info!(writer = %self.name, flushes = self.stats.flushes(), "batch writer stopped");
    }

    fn note_dropped(&self, before: u64) {
        let dropped = self.buffer.dropped() - before;
        if dropped > 0 {
            let total = self.stats.dropped.fetch_add(dropped, Ordering::Relaxed) + dropped;
            if total == dropped || total % 1000 < dropped {
                tracing::warn!(writer = %self.name, dropped = total, "buffer limit reached; oldest records dropped");
            }
        }
    }

    /// Write the whole buffer in chunks of `max_size`, stopping at the first failure.
    async fn flush(&mut self) -> bool {
        let mut ok = true;
        while !self.buffer.is_empty() {
            let chunk = self.buffer.take_chunk();
            let batch = self.encode(&chunk);
            if batch.records.is_empty() {
                continue;
            }
            match self.destination.write(&batch).await {
                Ok(()) => {
                    self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                    self.stats.flushed_records.fetch_add(batch.records.len() as u64, Ordering::Relaxed);
                    tracing::debug!(
                        writer = %self.name,
                        partition = %batch.partition.display(),
                        records = batch.records.len(),
                        "batch flushed"
                    );
                }
                Err(error) => {
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    self.buffer.restore(chunk);
                    tracing::warn!(
                        writer = %self.name,
                        error = %error,
                        retained = self.buffer.len(),
                        "batch flush failed; retrying at next threshold"
                    );
                    ok = false;
                    break;
                }
            }
        }
        self.buffer.mark_attempt(Instant::now());
        ok
    }

    fn encode(&self, chunk: &[R]) -> Batch {
        let records = chunk
            .iter()
            .filter(|record| self.batch_filter.as_ref().map_or(true, |keep| keep(record)))
            .filter_map(|record| match serde_json::to_value(record) {
                Ok(value) => Some(value),
                Err(error) => {
                    tracing::error!(writer = %self.name, error = %error, "record cannot be encoded; skipped");
                    None
                }
            })
            .collect();
        let created_at = Utc::now();
        Batch { partition: partition_path(&self.sub_path, created_at), records, created_at }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TraceEvent;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct MemoryDestination {
        batches: Mutex<Vec<Batch>>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl BatchDestination for MemoryDestination {
        async fn write(&self, batch: &Batch) -> Result<(), SinkError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(SinkError::transport("disk full"));
            }
            self.batches.lock().unwrap().push(batch.clone());
            Ok(())
        }
    }

    fn sizes(dest: &MemoryDestination) -> Vec<usize> {
        dest.batches.lock().unwrap().iter().map(|b| b.records.len()).collect()
    }

    #[test]
    fn buffer_reports_size_threshold_per_attempt() {
        let now = Instant::now();
        let mut buffer = BatchBuffer::new(3, Duration::from_secs(30), None);
        assert!(!buffer.push(1, now));
        assert!(!buffer.push(2, now));
        assert!(buffer.push(3, now));

        // failed attempt: items stay, the size trigger starts over
        buffer.mark_attempt(now);
        assert_eq!(buffer.len(), 3);
        assert!(!buffer.push(4, now));
        assert_eq!(buffer.take_chunk(), vec![1, 2, 3]);
        assert_eq!(buffer.take_chunk(), vec![4]);
    }

    #[test]
    fn restore_keeps_original_order() {
        let now = Instant::now();
        let mut buffer = BatchBuffer::new(2, Duration::from_secs(1), None);
        for i in 0..5 {
            buffer.push(i, now);
        }
        let chunk = buffer.take_chunk();
        buffer.restore(chunk);
        assert_eq!(buffer.take_chunk(), vec![0, 1]);
    }

    #[test]
    fn valve_drops_oldest() {
        let now = Instant::now();
        let mut buffer = BatchBuffer::new(2, Duration::from_secs(1), Some(3));
        for i in 0..5 {
            buffer.push(i, now);
        }
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.take_chunk(), vec![2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn age_threshold_uses_first_item_time() {
        let mut buffer = BatchBuffer::new(10, Duration::from_secs(30), None);
        assert!(!buffer.age_due(Instant::now()));
        buffer.push("a", Instant::now());
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!buffer.age_due(Instant::now()));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(buffer.age_due(Instant::now()));
    }

    #[test]
    fn partition_layout() {
        let at = DateTime::parse_from_rfc3339("2024-03-05T07:08:09Z").unwrap().with_timezone(&Utc);
        let path = partition_path("tracing", at);
        let text = path.to_string_lossy().replace('\\', "/");
        assert!(text.starts_with("tracing/20240305/070809-"), "{text}");
        assert_eq!(text.len(), "tracing/20240305/070809-".len() + 8);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_is_retried_with_the_same_records() {
        let dest = Arc::new(MemoryDestination::default());
        dest.failing.store(true, Ordering::SeqCst);
        let writer = BatchWriter::<TraceEvent>::builder(BatchConfig::new("tracing").with_max_size(2), dest.clone())
            .spawn()
            .unwrap();

        for uri in ["/a", "/b"] {
            writer.append(Arc::new(TraceEvent::new("GET", uri))).unwrap();
        }
        assert!(!writer.flush().await);
        assert_eq!(writer.stats().failures(), 2);

        dest.failing.store(false, Ordering::SeqCst);
        assert!(writer.flush().await);
        assert_eq!(sizes(&dest), vec![2]);
        writer.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn commands_queued_behind_shutdown_are_not_lost() {
        let dest = Arc::new(MemoryDestination::default());
        let writer = BatchWriter::<TraceEvent>::builder(BatchConfig::new("tracing"), dest.clone())
            .spawn()
            .unwrap();

        // queued before the task gets to run: Event, Shutdown, Flush, Event
        writer.append(Arc::new(TraceEvent::new("GET", "/a"))).unwrap();
        let (ack, flushed) = oneshot::channel();
        let tx = &writer.inner.tx;
        assert!(tx.send(Command::Shutdown).is_ok());
        assert!(tx.send(Command::Flush(ack)).is_ok());
        writer.append(Arc::new(TraceEvent::new("GET", "/b"))).unwrap();

        assert!(flushed.await.unwrap());
        writer.shutdown(Duration::from_secs(1)).await;

        assert_eq!(sizes(&dest), vec![2]);
        assert_eq!(dest.batches.lock().unwrap()[0].records[1]["uri"], "/b");
    }

    #[tokio::test]
    async fn transform_and_batch_filter_shape_records() {
        let dest = Arc::new(MemoryDestination::default());
        let writer = BatchWriter::<TraceEvent>::builder(BatchConfig::new("ops"), dest.clone())
            .transform(|event: &TraceEvent| (event.uri.clone(), event.status))
            .batch_filter(|(_, status)| *status >= 500)
            .spawn()
            .unwrap();

        writer.append(Arc::new(TraceEvent::new("GET", "/ok").with_status(200))).unwrap();
        writer.append(Arc::new(TraceEvent::new("GET", "/bad").with_status(503))).unwrap();
        writer.shutdown(Duration::from_secs(1)).await;

        let batches = dest.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].records, vec![serde_json::json!(["/bad", 503])]);
    }
}
