use crate::error::StoreError;
use crate::record::Record;
use crate::store::{RecordStore, ScanFilter, ScanOrder};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

/// Most recent record per hostname, maintained as records are accepted.
#[derive(Debug, Default)]
pub struct LatestIndex {
    entries: RwLock<HashMap<String, Record>>,
}

impl LatestIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replays the whole log. Used on startup, which also repairs an index
    /// that missed an update because the process died right after an append.
    pub fn rebuild_from(store: &RecordStore) -> Result<Self, StoreError> {
        let index = Self::new();
        let mut replayed = 0u64;
        for record in store.scan(ScanFilter::all(), ScanOrder::Insertion) {
            index.update(record?);
            replayed += 1;
        }
        tracing::info!(replayed, devices = index.len(), "rebuilt latest-value index");
        Ok(index)
    }

    /// Stores `record` if its `ts` is at least the held one's. Equal
    /// timestamps go to the later call. Returns whether the entry changed.
    pub fn update(&self, record: Record) -> bool {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let stale = entries
            .get(&record.hostname)
            .map(|current| record.ts < current.ts)
            .unwrap_or(false);
        if stale {
            return false;
        }
        entries.insert(record.hostname.clone(), record);
        true
    }

    /// `None` for a device that has never reported.
    pub fn get(&self, hostname: &str) -> Option<Record> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hostname)
            .cloned()
    }

    pub fn get_all(&self) -> BTreeMap<String, Record> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(hostname, record)| (hostname.clone(), record.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
