use crate::error::StoreError;
use crate::record::{Record, NUMERIC_FIELDS};
use crate::store::{RecordStore, ScanFilter, ScanOrder};
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Field that partitions aggregates alongside the time bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKey {
    #[default]
    Hostname,
    Host,
    Ipaddress,
    Macaddress,
}

impl GroupKey {
    pub fn value_of(&self, record: &Record) -> Option<String> {
        match self {
            GroupKey::Hostname => Some(record.hostname.clone()),
            GroupKey::Host => record.host.clone(),
            GroupKey::Ipaddress => record.ipaddress.clone(),
            GroupKey::Macaddress => record.macaddress.clone(),
        }
    }
}

impl FromStr for GroupKey {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hostname" => Ok(GroupKey::Hostname),
            "host" => Ok(GroupKey::Host),
            "ipaddress" => Ok(GroupKey::Ipaddress),
            "macaddress" => Ok(GroupKey::Macaddress),
            other => Err(format!("unknown group key `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rollup {
    Minute,
    Hour,
}

impl Rollup {
    pub fn bucket_size(self) -> ChronoDuration {
        match self {
            Rollup::Minute => ChronoDuration::seconds(60),
            Rollup::Hour => ChronoDuration::seconds(3600),
        }
    }
}

impl FromStr for Rollup {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "minute" | "1m" => Ok(Rollup::Minute),
            "hour" | "1h" => Ok(Rollup::Hour),
            other => Err(format!("unknown rollup `{other}`")),
        }
    }
}

/// `None` everywhere when the field had no non-null value in the bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FieldStats {
    pub min: Option<f64>,
    pub avg: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketAggregate {
    pub bucket_start: i64,
    pub bucket_seconds: i64,
    pub group_value: Option<String>,
    /// All records in the bucket, including ones with null payload fields.
    pub count: u64,
    pub fields: BTreeMap<String, FieldStats>,
}

/// Records with `now - window <= ts <= now`, newest first.
pub fn recent(
    store: &RecordStore,
    window: ChronoDuration,
    now: i64,
) -> Result<Vec<Record>, StoreError> {
    let Some(since) = window_start(window, now) else {
        return Ok(Vec::new());
    };
    store
        .scan(ScanFilter::window(since, now), ScanOrder::TsDescending)
        .collect()
}

/// Groups the window into `floor(ts / bucket_size) * bucket_size` buckets per
/// group value. Ordered by bucket start, then group value.
pub fn bucket_aggregate(
    store: &RecordStore,
    bucket_size: ChronoDuration,
    window: ChronoDuration,
    now: i64,
    group_key: GroupKey,
) -> Result<Vec<BucketAggregate>, StoreError> {
    let Some(since) = window_start(window, now) else {
        return Ok(Vec::new());
    };
    let mut aggregator = BucketAggregator::new(bucket_size, group_key);
    for record in store.scan(ScanFilter::window(since, now), ScanOrder::Insertion) {
        aggregator.add(&record?);
    }
    Ok(aggregator.finish())
}

pub fn rollup(
    store: &RecordStore,
    rollup: Rollup,
    window: ChronoDuration,
    now: i64,
    group_key: GroupKey,
) -> Result<Vec<BucketAggregate>, StoreError> {
    bucket_aggregate(store, rollup.bucket_size(), window, now, group_key)
}

fn window_start(window: ChronoDuration, now: i64) -> Option<i64> {
    let secs = window.num_seconds();
    if secs < 0 {
        return None;
    }
    Some(now.saturating_sub(secs))
}

pub struct BucketAggregator {
    bucket_seconds: i64,
    group_key: GroupKey,
    buckets: BTreeMap<(i64, Option<String>), BucketAccumulator>,
}

impl BucketAggregator {
    pub fn new(bucket_size: ChronoDuration, group_key: GroupKey) -> Self {
        Self {
            bucket_seconds: bucket_size.num_seconds().max(1),
            group_key,
            buckets: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, record: &Record) {
        let bucket_start = record.ts.div_euclid(self.bucket_seconds) * self.bucket_seconds;
        let key = (bucket_start, self.group_key.value_of(record));
        let bucket = self.buckets.entry(key).or_default();
        bucket.count += 1;
        for (idx, field) in NUMERIC_FIELDS.iter().enumerate() {
            if let Some(value) = record.numeric(field) {
                bucket.fields[idx].add(value);
            }
        }
    }

    pub fn finish(self) -> Vec<BucketAggregate> {
        let bucket_seconds = self.bucket_seconds;
        self.buckets
            .into_iter()
            .map(|((bucket_start, group_value), bucket)| BucketAggregate {
                bucket_start,
                bucket_seconds,
                group_value,
                count: bucket.count,
                fields: NUMERIC_FIELDS
                    .iter()
                    .zip(bucket.fields.iter())
                    .map(|(name, acc)| (name.to_string(), acc.stats()))
                    .collect(),
            })
            .collect()
    }
}

#[derive(Debug)]
struct BucketAccumulator {
    count: u64,
    fields: Vec<FieldAccumulator>,
}

impl Default for BucketAccumulator {
    fn default() -> Self {
        Self {
            count: 0,
            fields: vec![FieldAccumulator::default(); NUMERIC_FIELDS.len()],
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct FieldAccumulator {
    sum: f64,
    samples: u64,
    min: Option<f64>,
    max: Option<f64>,
}

impl FieldAccumulator {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.samples += 1;
        self.min = Some(self.min.map_or(value, |min| min.min(value)));
        self.max = Some(self.max.map_or(value, |max| max.max(value)));
    }

    fn stats(&self) -> FieldStats {
        FieldStats {
            min: self.min,
            avg: (self.samples > 0).then(|| self.sum / self.samples as f64),
            max: self.max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::parse_record;
    use crate::store::StoreOptions;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> RecordStore {
        RecordStore::open(StoreOptions::new(dir.path())).unwrap()
    }

    fn append(store: &RecordStore, raw: Value) {
        store.append(parse_record(&raw).unwrap()).unwrap();
    }

    #[test]
    fn recent_includes_lower_boundary_and_excludes_future() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let now = 10_000;
        append(&store, json!({"uuid": "old", "hostname": "pi1", "ts": now - 3601}));
        append(&store, json!({"uuid": "edge", "hostname": "pi1", "ts": now - 3600}));
        append(&store, json!({"uuid": "mid", "hostname": "pi2", "ts": now - 10}));
        append(&store, json!({"uuid": "now", "hostname": "pi1", "ts": now}));
        append(&store, json!({"uuid": "future", "hostname": "pi1", "ts": now + 1}));

        let uuids: Vec<_> = recent(&store, ChronoDuration::hours(1), now)
            .unwrap()
            .into_iter()
            .map(|r| r.uuid)
            .collect();
        assert_eq!(uuids, vec!["now", "mid", "edge"]);
    }

    #[test]
    fn empty_window_is_empty_result() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(recent(&store, ChronoDuration::hours(1), 500).unwrap().is_empty());
        assert!(bucket_aggregate(
            &store,
            ChronoDuration::seconds(60),
            ChronoDuration::hours(1),
            500,
            GroupKey::Hostname
        )
        .unwrap()
        .is_empty());

        append(&store, json!({"uuid": "a", "hostname": "pi1", "ts": 100}));
        assert!(recent(&store, ChronoDuration::seconds(-1), 100).unwrap().is_empty());
    }

    #[test]
    fn buckets_each_minute_separately() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        append(&store, json!({"uuid": "a", "hostname": "pi1", "ts": 100, "temperature": 70}));
        append(&store, json!({"uuid": "b", "hostname": "pi1", "ts": 140, "temperature": 71}));
        append(&store, json!({"uuid": "c", "hostname": "pi1", "ts": 190, "temperature": 72}));

        let buckets = bucket_aggregate(
            &store,
            ChronoDuration::seconds(60),
            ChronoDuration::seconds(120),
            200,
            GroupKey::Hostname,
        )
        .unwrap();

        let summary: Vec<_> = buckets
            .iter()
            .map(|b| (b.bucket_start, b.count, b.fields["temperature"].avg))
            .collect();
        assert_eq!(
            summary,
            vec![
                (60, 1, Some(70.0)),
                (120, 1, Some(71.0)),
                (180, 1, Some(72.0)),
            ]
        );
        assert!(buckets.iter().all(|b| b.group_value.as_deref() == Some("pi1")));
    }

    #[test]
    fn null_fields_are_skipped_but_counted() {
        let mut aggregator = BucketAggregator::new(ChronoDuration::seconds(60), GroupKey::Hostname);
        for raw in [
            json!({"uuid": "a", "hostname": "pi1", "ts": 0, "temperature": 70.0, "lux": 10.0}),
            json!({"uuid": "b", "hostname": "pi1", "ts": 10, "temperature": 74.0}),
            json!({"uuid": "c", "hostname": "pi1", "ts": 20, "temperature": "n/a"}),
        ] {
            aggregator.add(&parse_record(&raw).unwrap());
        }

        let buckets = aggregator.finish();
        assert_eq!(buckets.len(), 1);
        let bucket = &buckets[0];
        assert_eq!(bucket.count, 3);
        assert_eq!(
            bucket.fields["temperature"],
            FieldStats {
                min: Some(70.0),
                avg: Some(72.0),
                max: Some(74.0)
            }
        );
        assert_eq!(bucket.fields["lux"].avg, Some(10.0));
        assert_eq!(bucket.fields["humidity"], FieldStats::default());
    }

    #[test]
    fn groups_by_device_and_orders_by_bucket_then_group() {
        let mut aggregator = BucketAggregator::new(ChronoDuration::seconds(60), GroupKey::Hostname);
        for raw in [
            json!({"uuid": "a", "hostname": "pi2", "ts": 5, "humidity": 40.0}),
            json!({"uuid": "b", "hostname": "pi1", "ts": 65, "humidity": 41.0}),
            json!({"uuid": "c", "hostname": "pi1", "ts": 6, "humidity": 42.0}),
        ] {
            aggregator.add(&parse_record(&raw).unwrap());
        }
        let keys: Vec<_> = aggregator
            .finish()
            .into_iter()
            .map(|b| (b.bucket_start, b.group_value.unwrap()))
            .collect();
        assert_eq!(
            keys,
            vec![
                (0, "pi1".to_string()),
                (0, "pi2".to_string()),
                (60, "pi1".to_string())
            ]
        );
    }

    #[test]
    fn negative_timestamps_floor_into_earlier_bucket() {
        let mut aggregator = BucketAggregator::new(ChronoDuration::seconds(60), GroupKey::Hostname);
        aggregator.add(&parse_record(&json!({"hostname": "pi1", "ts": -1})).unwrap());
        assert_eq!(aggregator.finish()[0].bucket_start, -60);
    }

    #[test]
    fn missing_group_value_is_grouped_as_null() {
        let mut aggregator = BucketAggregator::new(ChronoDuration::seconds(60), GroupKey::Ipaddress);
        aggregator.add(&parse_record(&json!({"hostname": "pi1", "ts": 1})).unwrap());
        aggregator.add(
            &parse_record(&json!({"hostname": "pi2", "ts": 2, "ipaddress": "10.0.0.2"})).unwrap(),
        );
        let groups: Vec<_> = aggregator.finish().into_iter().map(|b| b.group_value).collect();
        assert_eq!(groups, vec![None, Some("10.0.0.2".to_string())]);
    }

    #[test]
    fn hourly_rollup_uses_hour_buckets() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        append(&store, json!({"uuid": "a", "hostname": "pi1", "ts": 3599, "pressure": 1000.0}));
        append(&store, json!({"uuid": "b", "hostname": "pi1", "ts": 3600, "pressure": 1010.0}));
        append(&store, json!({"uuid": "c", "hostname": "pi1", "ts": 5000, "pressure": 1020.0}));

        let buckets = rollup(
            &store,
            Rollup::Hour,
            ChronoDuration::hours(2),
            7000,
            GroupKey::Hostname,
        )
        .unwrap();
        let summary: Vec<_> = buckets
            .iter()
            .map(|b| (b.bucket_start, b.count, b.fields["pressure"].max))
            .collect();
        assert_eq!(summary, vec![(0, 1, Some(1000.0)), (3600, 2, Some(1020.0))]);
    }

    #[test]
    fn group_key_and_rollup_parse_from_query_strings() {
        assert_eq!("HostName".parse::<GroupKey>(), Ok(GroupKey::Hostname));
        assert_eq!("macaddress".parse::<GroupKey>(), Ok(GroupKey::Macaddress));
        assert!("rack".parse::<GroupKey>().is_err());
        assert_eq!("1h".parse::<Rollup>(), Ok(Rollup::Hour));
        assert_eq!("minute".parse::<Rollup>(), Ok(Rollup::Minute));
    }
}
