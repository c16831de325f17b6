#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracebus::batch::{Batch, BatchDestination};
use tracebus::SinkError;

/// Keeps every written batch; can be switched into failure mode.
#[derive(Default)]
pub struct MemoryDestination {
    pub batches: Mutex<Vec<Batch>>,
    pub failing: AtomicBool,
}

impl MemoryDestination {
    pub fn sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(|b| b.records.len()).collect()
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl BatchDestination for MemoryDestination {
    async fn write(&self, batch: &Batch) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::transport("destination unavailable"));
        }
        self.batches.lock().unwrap().push(batch.clone());
        Ok(())
    }
}

/// Poll `check` on the (paused) tokio clock until it holds or `limit` polls pass.
pub async fn eventually(limit: usize, mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..limit {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
