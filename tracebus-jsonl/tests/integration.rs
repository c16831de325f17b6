use flate2::read::GzDecoder;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracebus::batch::{partition_path, Batch, BatchConfig, BatchDestination, BatchWriter};
use tracebus::event::{ErrorEvent, ReportedError, TraceEvent};
use tracebus::hub::{Hub, HubConfig};
use tracebus::settings::Settings;
use tracebus_jsonl::{attach_datapool, JsonlDestination};

fn files_under(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}

fn batch(records: Vec<serde_json::Value>) -> Batch {
    let created_at = chrono::Utc::now();
    Batch { partition: partition_path("tracing", created_at), records, created_at }
}

#[tokio::test]
async fn writes_one_line_per_record() {
    let dir = tempfile::tempdir().unwrap();
    let destination = JsonlDestination::new(dir.path());
    let batch = batch(vec![serde_json::json!({"uri": "/a"}), serde_json::json!({"uri": "/b"})]);

    destination.write(&batch).await.unwrap();

    let path = destination.file_path(&batch.partition);
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text, "{\"uri\":\"/a\"}\n{\"uri\":\"/b\"}\n");
    assert_eq!(files_under(dir.path()), vec![path], "no staging file left behind");
}

#[tokio::test]
async fn gzip_output_decompresses_to_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let destination = JsonlDestination::new(dir.path()).with_gzip(true);
    let batch = batch(vec![serde_json::json!({"n": 1})]);

    destination.write(&batch).await.unwrap();

    let compressed = std::fs::read(destination.file_path(&batch.partition)).unwrap();
    let mut text = String::new();
    GzDecoder::new(&compressed[..]).read_to_string(&mut text).unwrap();
    assert_eq!(text, "{\"n\":1}\n");
}

#[tokio::test]
async fn unwritable_root_reports_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"x").unwrap();

    let err = JsonlDestination::new(&blocker).write(&batch(vec![serde_json::json!(1)])).await.unwrap_err();
    assert!(matches!(err, tracebus::SinkError::Io(_)));
}

#[tokio::test]
async fn writer_flushes_into_partitioned_files() {
    let dir = tempfile::tempdir().unwrap();
    let writer = BatchWriter::<TraceEvent>::builder(
        BatchConfig::new("tracing").with_max_size(2),
        JsonlDestination::new(dir.path()),
    )
    .spawn()
    .unwrap();

    for uri in ["/1", "/2", "/3"] {
        writer.append(Arc::new(TraceEvent::new("GET", uri))).unwrap();
    }
    writer.shutdown(Duration::from_secs(5)).await;

    let files = files_under(&dir.path().join("tracing"));
    assert_eq!(files.len(), 2);
    let lines: usize = files.iter().map(|f| std::fs::read_to_string(f).unwrap().lines().count()).sum();
    assert_eq!(lines, 3);
}

#[tokio::test]
async fn datapool_archives_errors_as_flat_records() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.datapool.path = dir.path().to_string_lossy().into_owned();

    let hub = Hub::new(HubConfig::default()).unwrap();
    assert!(attach_datapool(&hub, &settings).unwrap());
    hub.start();
    hub.push_error(ErrorEvent::new(ReportedError("db down".into()), "/orders"));
    hub.shutdown().await;

    let files = files_under(&dir.path().join("errorReport"));
    assert_eq!(files.len(), 1);
    let line: serde_json::Value = serde_json::from_str(std::fs::read_to_string(&files[0]).unwrap().trim()).unwrap();
    assert_eq!(line["error"], "db down");
    assert_eq!(line["uri"], "/orders");
}

#[tokio::test]
async fn datapool_can_be_disabled() {
    let mut settings = Settings::default();
    settings.datapool.path = "-".into();
    let hub = Hub::new(HubConfig::default()).unwrap();
    assert!(!attach_datapool(&hub, &settings).unwrap());
}
