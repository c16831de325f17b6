//! JSON-lines batch destination for `tracebus`.
//!
//! Each flushed batch becomes one file under the root directory,
//! `<root>/<sub_path>/<YYYYMMDD>/<HHMMSS>-<8 hex>.jsonl`, with one record per line.
//! With gzip enabled the file is compressed and gets a `.jsonl.gz` extension.
//!
//! Files are written to a temporary name first and renamed, so readers never see a partial
//! batch.

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracebus::batch::{Batch, BatchConfig, BatchDestination, BatchWriter};
use tracebus::error::{ConfigError, SinkError};
use tracebus::event::{ErrorEvent, ErrorRecord, EventKind, JobOutcomeEvent, TraceEvent};
use tracebus::hub::Hub;
use tracebus::settings::{DatapoolSettings, Settings};

#[derive(Clone, Debug)]
pub struct JsonlDestination {
    root: PathBuf,
    gzip: bool,
}

impl JsonlDestination {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), gzip: false }
    }

    pub fn with_gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute file path for a batch partition.
    pub fn file_path(&self, partition: &Path) -> PathBuf {
        let extension = if self.gzip { "jsonl.gz" } else { "jsonl" };
        self.root.join(partition).with_extension(extension)
    }

    fn encode(&self, batch: &Batch) -> Result<Vec<u8>, SinkError> {
        let mut lines = Vec::new();
        for record in &batch.records {
            serde_json::to_writer(&mut lines, record)?;
            lines.push(b'\n');
        }
        if !self.gzip {
            return Ok(lines);
        }
        let mut encoder = GzEncoder::new(Vec::with_capacity(lines.len() / 4), Compression::fast());
        encoder.write_all(&lines)?;
        Ok(encoder.finish()?)
    }
}

#[async_trait]
impl BatchDestination for JsonlDestination {
    async fn write(&self, batch: &Batch) -> Result<(), SinkError> {
        let path = self.file_path(&batch.partition);
        let bytes = self.encode(batch)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut staging = path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        tokio::fs::write(&staging, &bytes).await?;
        if let Err(error) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(error.into());
        }
        tracing::debug!(path = %path.display(), records = batch.records.len(), bytes = bytes.len(), "batch file written");
        Ok(())
    }
}

/// Batch configuration for one event kind from the datapool settings.
pub fn batch_config(settings: &DatapoolSettings, kind: EventKind) -> BatchConfig {
    let mut config = BatchConfig::new(kind.archive_dir())
        .with_max_size(settings.buffer_size)
        .with_max_age(settings.buffer_duration());
    config.max_buffered = settings.max_buffered;
    config
}

/// Attach one JSON-lines writer per event kind to `hub`. Errors are archived as flat
/// [`ErrorRecord`]s. Returns `false` when the datapool is disabled.
pub fn attach_datapool(hub: &Hub, settings: &Settings) -> Result<bool, ConfigError> {
    let Some(root) = settings.datapool.root_from_env(&settings.app.name) else {
        tracing::info!("datapool disabled");
        return Ok(false);
    };
    let destination = JsonlDestination::new(&root).with_gzip(settings.datapool.gzip());

    let traces = BatchWriter::<TraceEvent>::builder(
        batch_config(&settings.datapool, EventKind::Trace),
        destination.clone(),
    )
    .spawn()?;
    let errors = BatchWriter::<ErrorEvent>::builder(
        batch_config(&settings.datapool, EventKind::Error),
        destination.clone(),
    )
    .transform(|event: &ErrorEvent| ErrorRecord::from(event))
    .spawn()?;
    let jobs = BatchWriter::<JobOutcomeEvent>::builder(
        batch_config(&settings.datapool, EventKind::JobOutcome),
        destination,
    )
    .spawn()?;

    hub.attach_writer(traces);
    hub.attach_writer(errors);
    hub.attach_writer(jobs);
    tracing::info!(root = %root.display(), gzip = settings.datapool.gzip(), "datapool enabled");
    Ok(true)
}
