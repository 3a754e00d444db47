use crate::ingest::{IngestStats, WeatherIngestor};
use anyhow::Result;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

pub type Batch = Vec<Value>;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Transport-side queue in front of the ingestor.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<Batch>,
    stats: Arc<IngestStats>,
}

impl PipelineHandle {
    pub fn new(tx: mpsc::Sender<Batch>, stats: Arc<IngestStats>) -> Self {
        Self { tx, stats }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub async fn submit(&self, batch: Batch) -> Result<()> {
        let queue_depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue_depth, batch_len = batch.len(), "queued batch");
        if let Err(err) = self.tx.send(batch).await {
            self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(anyhow::anyhow!("ingest pipeline closed: {err}"));
        }
        Ok(())
    }
}

/// Starts `workers` tasks draining one queue, so several batches are ingested
/// at once. Workers exit once every [`PipelineHandle`] is dropped and the
/// queue is empty.
pub fn spawn_workers(
    ingestor: WeatherIngestor,
    rx: mpsc::Receiver<Batch>,
    workers: usize,
    retry: RetryPolicy,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..workers.max(1))
        .map(|worker| {
            let rx = rx.clone();
            let ingestor = ingestor.clone();
            tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    let Some(batch) = next else {
                        break;
                    };
                    ingestor
                        .stats()
                        .queue_depth
                        .fetch_sub(1, Ordering::Relaxed);
                    ingest_with_retry(&ingestor, Arc::new(batch), retry, worker).await;
                }
                tracing::debug!(worker, "ingest worker stopped");
            })
        })
        .collect()
}

async fn ingest_with_retry(
    ingestor: &WeatherIngestor,
    batch: Arc<Batch>,
    retry: RetryPolicy,
    worker: usize,
) {
    let attempts = retry.attempts.max(1);
    for attempt in 1..=attempts {
        let task_ingestor = ingestor.clone();
        let task_batch = batch.clone();
        let result =
            tokio::task::spawn_blocking(move || task_ingestor.ingest(&task_batch)).await;

        match result {
            Ok(Ok(report)) => {
                tracing::debug!(
                    worker,
                    attempt,
                    accepted = report.accepted,
                    rejected = report.rejected,
                    duplicates = report.duplicates,
                    "batch ingested"
                );
                return;
            }
            Ok(Err(err)) if err.is_retryable() && attempt < attempts => {
                let delay = retry.backoff(attempt);
                tracing::warn!(
                    worker,
                    attempt,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "store unavailable; retrying batch"
                );
                tokio::time::sleep(delay).await;
            }
            Ok(Err(err)) => {
                tracing::error!(
                    worker,
                    attempt,
                    error = %err,
                    batch_len = batch.len(),
                    "dropping batch after store failure"
                );
                return;
            }
            Err(err) => {
                ingestor.stats().record_error(err.to_string());
                tracing::error!(worker, error = %err, "ingest task panicked");
                return;
            }
        }
    }
}
