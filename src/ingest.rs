use crate::error::StoreError;
use crate::latest::LatestIndex;
use crate::record::parse_record;
use crate::store::{AppendOutcome, RecordStore, StoreStats};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub accepted: u64,
    pub rejected: u64,
    pub duplicates: u64,
}

impl IngestReport {
    pub fn total(&self) -> u64 {
        self.accepted + self.rejected + self.duplicates
    }
}

#[derive(Debug, Default)]
pub struct IngestStats {
    pub batches: AtomicU64,
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub duplicates: AtomicU64,
    pub store_failures: AtomicU64,
    pub queue_depth: AtomicU64,
    pub last_batch_unix_ms: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestStatsSnapshot {
    pub batches: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub store_failures: u64,
    pub queue_depth: u64,
    pub last_batch_unix_ms: u64,
    pub last_error: Option<String>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    /// Per-record outcomes, including those of a batch that aborted partway.
    fn record_counts(&self, report: &IngestReport) {
        self.accepted.fetch_add(report.accepted, Ordering::Relaxed);
        self.rejected.fetch_add(report.rejected, Ordering::Relaxed);
        self.duplicates.fetch_add(report.duplicates, Ordering::Relaxed);
    }

    fn record_batch(&self, report: &IngestReport) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.record_counts(report);
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last_batch_unix_ms.store(now, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            last_batch_unix_ms: self.last_batch_unix_ms.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

/// Ingestion entry point shared by the HTTP and MQTT surfaces.
#[derive(Clone)]
pub struct WeatherIngestor {
    store: Arc<RecordStore>,
    latest: Arc<LatestIndex>,
    stats: Arc<IngestStats>,
}

impl WeatherIngestor {
    pub fn new(store: Arc<RecordStore>, latest: Arc<LatestIndex>) -> Self {
        Self {
            store,
            latest,
            stats: Arc::new(IngestStats::new()),
        }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn latest(&self) -> &Arc<LatestIndex> {
        &self.latest
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub fn store_stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Parses, deduplicates and commits a batch in arrival order.
    ///
    /// Invalid records, and records too large to store, are counted as rejected
    /// and skipped. Any other store failure aborts the rest of the batch;
    /// records committed before it stay committed (and are counted in the
    /// stats), and resending the same batch is safe because they come back as
    /// duplicates.
    pub fn ingest(&self, batch: &[Value]) -> Result<IngestReport, StoreError> {
        let mut report = IngestReport::default();

        for raw in batch {
            let record = match parse_record(raw) {
                Ok(record) => record,
                Err(err) => {
                    tracing::debug!(error = %err, "rejected telemetry record");
                    report.rejected += 1;
                    continue;
                }
            };

            match self.store.append(record) {
                Ok(AppendOutcome::Appended(committed)) => {
                    self.latest.update(committed);
                    report.accepted += 1;
                }
                Ok(AppendOutcome::Duplicate) => report.duplicates += 1,
                Err(err @ StoreError::RecordTooLarge { .. }) => {
                    tracing::warn!(error = %err, "rejected oversized telemetry record");
                    report.rejected += 1;
                }
                Err(err) => {
                    self.stats.record_counts(&report);
                    self.stats.store_failures.fetch_add(1, Ordering::Relaxed);
                    self.stats.record_error(err.to_string());
                    tracing::error!(
                        error = %err,
                        batch_len = batch.len(),
                        committed = report.accepted,
                        "failed to persist telemetry batch"
                    );
                    return Err(err);
                }
            }
        }

        self.stats.record_batch(&report);
        self.stats.clear_error();
        tracing::debug!(
            batch_len = batch.len(),
            accepted = report.accepted,
            rejected = report.rejected,
            duplicates = report.duplicates,
            "ingested telemetry batch"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ScanFilter, ScanOrder, StoreOptions};
    use serde_json::json;
    use tempfile::TempDir;

    fn ingestor(dir: &TempDir) -> WeatherIngestor {
        let store = Arc::new(RecordStore::open(StoreOptions::new(dir.path())).unwrap());
        WeatherIngestor::new(store, Arc::new(LatestIndex::new()))
    }

    fn stored_uuids(ingestor: &WeatherIngestor) -> Vec<String> {
        ingestor
            .store()
            .scan(ScanFilter::all(), ScanOrder::Insertion)
            .map(|r| r.unwrap().uuid)
            .collect()
    }

    #[test]
    fn duplicate_in_batch_is_counted_and_latest_tracks_max_ts() {
        let dir = TempDir::new().unwrap();
        let ingestor = ingestor(&dir);
        let batch = vec![
            json!({"uuid": "a", "hostname": "pi1", "ts": 100, "temperature": 70.0}),
            json!({"uuid": "b", "hostname": "pi1", "ts": 200, "temperature": 72.5}),
            json!({"uuid": "a", "hostname": "pi1", "ts": 100, "temperature": 70.0}),
        ];

        let report = ingestor.ingest(&batch).unwrap();
        assert_eq!(
            report,
            IngestReport {
                accepted: 2,
                rejected: 0,
                duplicates: 1
            }
        );
        let latest = ingestor.latest().get("pi1").unwrap();
        assert_eq!(latest.ts, 200);
        assert_eq!(latest.temperature, Some(72.5));
    }

    #[test]
    fn counts_always_add_up_to_batch_len() {
        let dir = TempDir::new().unwrap();
        let ingestor = ingestor(&dir);
        let batch = vec![
            json!({"uuid": "a", "hostname": "pi1", "ts": 1}),
            json!({"uuid": "b", "ts": 2}),
            json!("not a record"),
            json!({"uuid": "c", "hostname": "pi2", "ts": "soon"}),
            json!({"uuid": "a", "hostname": "pi1", "ts": 1}),
            json!({"uuid": "d", "hostname": "pi2", "ts": 3, "lux": "bright"}),
        ];
        let report = ingestor.ingest(&batch).unwrap();
        assert_eq!(report.total(), batch.len() as u64);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected, 3);
        assert_eq!(report.duplicates, 1);
    }

    #[test]
    fn reingesting_a_batch_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let ingestor = ingestor(&dir);
        let batch = vec![
            json!({"uuid": "a", "hostname": "pi1", "ts": 100}),
            json!({"uuid": "b", "hostname": "pi2", "ts": 110}),
        ];

        ingestor.ingest(&batch).unwrap();
        let after_first = stored_uuids(&ingestor);
        let second = ingestor.ingest(&batch).unwrap();

        assert_eq!(second.duplicates, 2);
        assert_eq!(second.accepted, 0);
        assert_eq!(stored_uuids(&ingestor), after_first);
    }

    #[test]
    fn out_of_order_record_does_not_move_latest() {
        let dir = TempDir::new().unwrap();
        let ingestor = ingestor(&dir);
        ingestor
            .ingest(&[json!({"uuid": "new", "hostname": "pi1", "ts": 500})])
            .unwrap();
        let report = ingestor
            .ingest(&[json!({"uuid": "old", "hostname": "pi1", "ts": 400})])
            .unwrap();

        assert_eq!(report.accepted, 1);
        assert_eq!(ingestor.latest().get("pi1").unwrap().uuid, "new");
        assert_eq!(ingestor.store().len(), 2);
    }

    #[test]
    fn concurrent_batches_with_shared_uuids_commit_each_once() {
        let dir = TempDir::new().unwrap();
        let ingestor = ingestor(&dir);
        let batch: Vec<_> = (0..50)
            .map(|idx| json!({"uuid": format!("r{idx}"), "hostname": format!("pi{}", idx % 3), "ts": idx}))
            .collect();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ingestor = ingestor.clone();
                let batch = batch.clone();
                std::thread::spawn(move || ingestor.ingest(&batch).unwrap())
            })
            .collect();
        let reports: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let accepted: u64 = reports.iter().map(|r| r.accepted).sum();
        let duplicates: u64 = reports.iter().map(|r| r.duplicates).sum();
        assert_eq!(accepted, 50);
        assert_eq!(duplicates, 150);
        assert_eq!(ingestor.store().len(), 50);
        assert_eq!(ingestor.latest().get("pi0").unwrap().ts, 48);
        assert_eq!(ingestor.latest().get("pi1").unwrap().ts, 49);
        assert_eq!(ingestor.latest().get("pi2").unwrap().ts, 47);
    }

    #[test]
    fn oversized_record_is_rejected_and_batch_continues() {
        let dir = TempDir::new().unwrap();
        let ingestor = ingestor(&dir);
        let batch = vec![
            json!({"uuid": "a", "hostname": "pi1", "ts": 1}),
            json!({"uuid": "big", "hostname": "pi1", "ts": 2, "diskusage": "x".repeat(5 * 1024 * 1024)}),
            json!({"uuid": "c", "hostname": "pi1", "ts": 3}),
        ];

        let report = ingestor.ingest(&batch).unwrap();
        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(stored_uuids(&ingestor), vec!["a", "c"]);
        assert_eq!(ingestor.latest().get("pi1").unwrap().ts, 3);
    }

    #[test]
    fn store_failure_aborts_batch_and_resend_is_safe() {
        let dir = TempDir::new().unwrap();
        let ingestor = ingestor(&dir);
        let batch = vec![
            json!({"uuid": "a", "hostname": "pi1", "ts": 100}),
            json!({"uuid": "b", "hostname": "pi1", "ts": 200}),
            json!({"uuid": "c", "hostname": "pi2", "ts": 300}),
        ];
        ingestor.ingest(&batch[..1]).unwrap();

        ingestor.store().set_active_writable(false).unwrap();
        let err = ingestor.ingest(&batch).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(ingestor.store().len(), 1);
        assert!(ingestor.latest().get("pi2").is_none());

        let failed = ingestor.stats().snapshot();
        assert_eq!(failed.store_failures, 1);
        assert!(failed.last_error.is_some());
        assert_eq!(failed.batches, 1);
        assert_eq!(failed.duplicates, 1);

        ingestor.store().set_active_writable(true).unwrap();
        let report = ingestor.ingest(&batch).unwrap();
        assert_eq!(report.accepted + report.duplicates, batch.len() as u64);
        assert_eq!(report.duplicates, 1);
        assert_eq!(stored_uuids(&ingestor), vec!["a", "b", "c"]);
        assert!(ingestor.stats().snapshot().last_error.is_none());
    }

    #[test]
    fn partial_batch_before_failure_is_counted() {
        let dir = TempDir::new().unwrap();
        let ingestor = ingestor(&dir);
        ingestor
            .ingest(&[json!({"uuid": "a", "hostname": "pi1", "ts": 1})])
            .unwrap();

        // "a" is a duplicate and never reaches the disk, "b" does and fails.
        ingestor.store().set_active_writable(false).unwrap();
        ingestor
            .ingest(&[
                json!({"uuid": "a", "hostname": "pi1", "ts": 1}),
                json!({"hostname": "pi1"}),
                json!({"uuid": "b", "hostname": "pi1", "ts": 2}),
            ])
            .unwrap_err();

        let snapshot = ingestor.stats().snapshot();
        assert_eq!(snapshot.accepted, 1);
        assert_eq!(snapshot.duplicates, 1);
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.accepted, ingestor.store_stats().records);
    }

    #[test]
    fn stats_accumulate_across_batches() {
        let dir = TempDir::new().unwrap();
        let ingestor = ingestor(&dir);
        ingestor
            .ingest(&[json!({"uuid": "a", "hostname": "pi1", "ts": 1}), json!({})])
            .unwrap();
        ingestor
            .ingest(&[json!({"uuid": "a", "hostname": "pi1", "ts": 1})])
            .unwrap();

        let snapshot = ingestor.stats().snapshot();
        assert_eq!(snapshot.batches, 2);
        assert_eq!(snapshot.accepted, 1);
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.duplicates, 1);
        assert!(snapshot.last_batch_unix_ms > 0);
        assert!(snapshot.last_error.is_none());
    }
}
