use crate::error::StoreError;
use crate::record::Record;
use chrono::{DateTime, TimeZone, Utc};
use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const SEGMENT_MAGIC: &[u8; 8] = b"WXLOG001";
const SEGMENT_VERSION: u32 = 1;
const SEGMENT_HEADER_LEN: usize = 64;
const FRAME_HEADER_LEN: u64 = 8;
/// Upper bound on one encoded record. `append` refuses anything larger, and
/// readers treat a larger length prefix as corruption.
pub const MAX_FRAME_LEN: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub data_dir: PathBuf,
    /// Age after which the active segment is closed; one segment per retention period.
    pub segment_roll_duration: Duration,
    pub segment_roll_bytes: u64,
    /// Zero syncs on every append.
    pub sync_interval: Duration,
}

impl StoreOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            segment_roll_duration: Duration::from_secs(24 * 3600),
            segment_roll_bytes: 128 * 1024 * 1024,
            sync_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub hostname: Option<String>,
    /// Inclusive lower bound on `ts`.
    pub since: Option<i64>,
    /// Inclusive upper bound on `ts`.
    pub until: Option<i64>,
}

impl ScanFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn window(since: i64, until: i64) -> Self {
        Self {
            hostname: None,
            since: Some(since),
            until: Some(until),
        }
    }

    pub fn for_host(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    fn matches(&self, record: &Record) -> bool {
        if let Some(hostname) = &self.hostname {
            if &record.hostname != hostname {
                return false;
            }
        }
        if self.since.map(|since| record.ts < since).unwrap_or(false) {
            return false;
        }
        if self.until.map(|until| record.ts > until).unwrap_or(false) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanOrder {
    #[default]
    Insertion,
    TsAscending,
    TsDescending,
}

#[derive(Debug, Clone)]
pub enum AppendOutcome {
    /// Committed, with `datetimestamp` stamped.
    Appended(Record),
    Duplicate,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub records: u64,
    pub segments: usize,
    pub bytes: u64,
    pub next_seq: u64,
}

#[derive(Serialize)]
struct StoredRecordRef<'a> {
    seq: u64,
    record: &'a Record,
}

#[derive(Deserialize)]
struct StoredRecord {
    seq: u64,
    record: Record,
}

/// Durable, insertion-ordered log of accepted records.
///
/// Writers serialize on one mutex that also guards the uuid index, so the
/// dedup check and the append happen as one step. Scans only take the lock
/// long enough to capture which segments exist and how many bytes of each are
/// committed, then read from disk without it.
pub struct RecordStore {
    options: StoreOptions,
    state: Mutex<StoreState>,
}

struct StoreState {
    uuids: HashSet<String>,
    closed: Vec<SegmentRef>,
    active: SegmentWriter,
    next_seq: u64,
    records: u64,
    last_sync_at: Instant,
}

#[derive(Debug, Clone)]
struct SegmentRef {
    path: PathBuf,
    start_seq: u64,
    committed_len: u64,
}

struct SegmentWriter {
    path: PathBuf,
    file: fs::File,
    start_seq: u64,
    len: u64,
    created_at: DateTime<Utc>,
}

impl RecordStore {
    pub fn open(options: StoreOptions) -> Result<Self, StoreError> {
        fs::create_dir_all(&options.data_dir)?;
        let dir = options.data_dir.clone();

        let mut found = list_segments(&dir)?;
        found.sort_by_key(|seg| seg.start_seq);
        let last_index = found.len().checked_sub(1);

        let mut uuids = HashSet::new();
        let mut next_seq = 1u64;
        let mut records = 0u64;
        let mut closed = Vec::new();
        let mut active = None;

        for (idx, seg) in found.into_iter().enumerate() {
            let committed_len = if seg.open {
                let mut file = fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&seg.path)?;
                recover_truncate_tail(&mut file, &seg.path, seg.start_seq)?
            } else {
                fs::metadata(&seg.path)?.len()
            };

            let mut last_seq = None;
            let file = fs::File::open(&seg.path)?;
            for stored in SegmentReader::new(file, seg.path.clone(), committed_len)? {
                let stored = stored?;
                next_seq = next_seq.max(stored.seq.saturating_add(1));
                last_seq = Some(stored.seq);
                uuids.insert(stored.record.uuid);
                records += 1;
            }

            if seg.open && Some(idx) == last_index {
                active = Some(SegmentWriter::reopen(seg.path, seg.start_seq, committed_len)?);
            } else if seg.open {
                // Left behind by a crash during a roll.
                match last_seq {
                    Some(end_seq) => {
                        let closed_path = segment_closed_path(&dir, seg.start_seq, end_seq);
                        fs::rename(&seg.path, &closed_path)?;
                        closed.push(SegmentRef {
                            path: closed_path,
                            start_seq: seg.start_seq,
                            committed_len,
                        });
                    }
                    None => fs::remove_file(&seg.path)?,
                }
            } else {
                closed.push(SegmentRef {
                    path: seg.path,
                    start_seq: seg.start_seq,
                    committed_len,
                });
            }
        }

        let active = match active {
            Some(writer) => writer,
            None => SegmentWriter::create(&dir, next_seq)?,
        };

        tracing::info!(
            dir = %dir.display(),
            records,
            segments = closed.len() + 1,
            next_seq,
            "opened record store"
        );

        Ok(Self {
            options,
            state: Mutex::new(StoreState {
                uuids,
                closed,
                active,
                next_seq,
                records,
                last_sync_at: Instant::now(),
            }),
        })
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Appends `record` unless its `uuid` is already in the log.
    ///
    /// On `Ok(Appended)` the record is visible to every later `scan` and
    /// `contains`. On `Err` nothing was committed.
    pub fn append(&self, mut record: Record) -> Result<AppendOutcome, StoreError> {
        let mut state = self.lock_state();
        if state.uuids.contains(&record.uuid) {
            return Ok(AppendOutcome::Duplicate);
        }

        record.datetimestamp = Some(Utc::now());
        let seq = state.next_seq;
        let payload = serde_json::to_vec(&StoredRecordRef {
            seq,
            record: &record,
        })?;
        if payload.len() as u64 > MAX_FRAME_LEN {
            return Err(StoreError::RecordTooLarge {
                uuid: record.uuid,
                len: payload.len() as u64,
                max: MAX_FRAME_LEN,
            });
        }

        let sync_now = self.options.sync_interval.is_zero()
            || state.last_sync_at.elapsed() >= self.options.sync_interval;
        state.active.append_frame(&payload, sync_now)?;
        if sync_now {
            state.last_sync_at = Instant::now();
        }

        state.uuids.insert(record.uuid.clone());
        state.next_seq = seq.saturating_add(1);
        state.records += 1;

        if state.active.should_roll(&self.options) {
            if let Err(err) = state.roll(&self.options.data_dir, seq) {
                tracing::warn!(error = %err, "failed to roll segment; continuing on current one");
            }
        }

        Ok(AppendOutcome::Appended(record))
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.lock_state().uuids.contains(uuid)
    }

    /// Reads the log as of this call. Each call re-reads persisted segments,
    /// so a scan can be restarted by calling `scan` again.
    pub fn scan(&self, filter: ScanFilter, order: ScanOrder) -> Scan {
        let records = RecordScan {
            dir: self.options.data_dir.clone(),
            pending: self.snapshot_segments().into(),
            current: None,
            filter,
        };

        let inner = match order {
            ScanOrder::Insertion => ScanInner::Lazy(records),
            ScanOrder::TsAscending | ScanOrder::TsDescending => {
                match records.collect::<Result<Vec<_>, _>>() {
                    Ok(mut all) => {
                        if order == ScanOrder::TsAscending {
                            all.sort_by_key(|record| record.ts);
                        } else {
                            all.sort_by(|a, b| b.ts.cmp(&a.ts));
                        }
                        ScanInner::Sorted(all.into_iter())
                    }
                    Err(err) => ScanInner::Failed(Some(err)),
                }
            }
        };
        Scan(inner)
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.lock_state();
        let closed_bytes: u64 = state.closed.iter().map(|seg| seg.committed_len).sum();
        StoreStats {
            records: state.records,
            segments: state.closed.len() + 1,
            bytes: closed_bytes.saturating_add(state.active.len),
            next_seq: state.next_seq,
        }
    }

    pub fn len(&self) -> u64 {
        self.lock_state().records
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swaps the active segment's handle for a read-only one (or back), so
    /// tests can make appends fail the way a full or revoked disk does.
    #[cfg(test)]
    pub(crate) fn set_active_writable(&self, writable: bool) -> io::Result<()> {
        let mut state = self.lock_state();
        let path = state.active.path.clone();
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path)?;
        file.seek(SeekFrom::Start(state.active.len))?;
        state.active.file = file;
        Ok(())
    }

    fn snapshot_segments(&self) -> Vec<SegmentRef> {
        let state = self.lock_state();
        let mut segments = state.closed.clone();
        segments.push(SegmentRef {
            path: state.active.path.clone(),
            start_seq: state.active.start_seq,
            committed_len: state.active.len,
        });
        segments
    }

    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        // A failed write truncates before returning, so state behind a poisoned
        // lock is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StoreState {
    fn roll(&mut self, dir: &Path, last_seq: u64) -> Result<(), StoreError> {
        self.active.file.sync_data()?;
        let next = SegmentWriter::create(dir, self.next_seq)?;
        let closed_path = segment_closed_path(dir, self.active.start_seq, last_seq);
        if let Err(err) = fs::rename(&self.active.path, &closed_path) {
            fs::remove_file(&next.path).ok();
            return Err(err.into());
        }

        let previous = std::mem::replace(&mut self.active, next);
        tracing::debug!(
            start_seq = previous.start_seq,
            end_seq = last_seq,
            bytes = previous.len,
            "closed segment"
        );
        self.closed.push(SegmentRef {
            path: closed_path,
            start_seq: previous.start_seq,
            committed_len: previous.len,
        });
        Ok(())
    }
}

impl SegmentWriter {
    fn create(dir: &Path, start_seq: u64) -> Result<Self, StoreError> {
        let path = segment_open_path(dir, start_seq);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let created_at = Utc::now();
        write_segment_header(&mut file, start_seq, created_at)?;
        file.sync_data().ok();
        Ok(Self {
            path,
            file,
            start_seq,
            len: SEGMENT_HEADER_LEN as u64,
            created_at,
        })
    }

    fn reopen(path: PathBuf, start_seq: u64, len: u64) -> Result<Self, StoreError> {
        let mut file = fs::OpenOptions::new().read(true).write(true).open(&path)?;
        file.seek(SeekFrom::Start(0))?;
        let header = read_segment_header(&mut file, &path)?;
        file.seek(SeekFrom::Start(len))?;
        Ok(Self {
            path,
            file,
            start_seq,
            len,
            created_at: header.created_at,
        })
    }

    fn append_frame(&mut self, payload: &[u8], sync: bool) -> io::Result<()> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32c(payload).to_le_bytes());
        frame.extend_from_slice(payload);

        let written = self.file.write_all(&frame).and_then(|()| {
            if sync {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(err) = written {
            self.file.set_len(self.len).ok();
            self.file.seek(SeekFrom::Start(self.len)).ok();
            return Err(err);
        }
        self.len = self.len.saturating_add(frame.len() as u64);
        Ok(())
    }

    fn should_roll(&self, options: &StoreOptions) -> bool {
        if self.len <= SEGMENT_HEADER_LEN as u64 {
            return false;
        }
        let age = (Utc::now() - self.created_at).to_std().unwrap_or_default();
        age >= options.segment_roll_duration || self.len >= options.segment_roll_bytes
    }
}

/// Lazily iterates the log. Created by [`RecordStore::scan`].
pub struct Scan(ScanInner);

enum ScanInner {
    Lazy(RecordScan),
    Sorted(std::vec::IntoIter<Record>),
    Failed(Option<StoreError>),
}

impl Iterator for Scan {
    type Item = Result<Record, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.0 {
            ScanInner::Lazy(records) => records.next(),
            ScanInner::Sorted(records) => records.next().map(Ok),
            ScanInner::Failed(err) => err.take().map(Err),
        }
    }
}

struct RecordScan {
    dir: PathBuf,
    pending: VecDeque<SegmentRef>,
    current: Option<SegmentReader>,
    filter: ScanFilter,
}

impl Iterator for RecordScan {
    type Item = Result<Record, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                let seg = self.pending.pop_front()?;
                match open_segment_for_read(&self.dir, &seg) {
                    Ok(reader) => self.current = Some(reader),
                    Err(err) => return Some(Err(err)),
                }
            }
            let reader = self.current.as_mut()?;
            match reader.next() {
                Some(Ok(stored)) => {
                    if self.filter.matches(&stored.record) {
                        return Some(Ok(stored.record));
                    }
                }
                Some(Err(err)) => {
                    self.current = None;
                    return Some(Err(err));
                }
                None => self.current = None,
            }
        }
    }
}

fn open_segment_for_read(dir: &Path, seg: &SegmentRef) -> Result<SegmentReader, StoreError> {
    let (file, path) = match fs::File::open(&seg.path) {
        Ok(file) => (file, seg.path.clone()),
        // The active segment may have been closed (renamed) since the snapshot.
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let Some(path) = find_closed_segment(dir, seg.start_seq)? else {
                return Err(err.into());
            };
            (fs::File::open(&path)?, path)
        }
        Err(err) => return Err(err.into()),
    };
    SegmentReader::new(file, path, seg.committed_len)
}

struct SegmentReader {
    path: PathBuf,
    reader: BufReader<fs::File>,
    remaining: u64,
    done: bool,
}

impl SegmentReader {
    fn new(file: fs::File, path: PathBuf, committed_len: u64) -> Result<Self, StoreError> {
        let mut reader = BufReader::new(file);
        read_segment_header(&mut reader, &path)?;
        Ok(Self {
            path,
            reader,
            remaining: committed_len.saturating_sub(SEGMENT_HEADER_LEN as u64),
            done: false,
        })
    }

    fn read_frame(&mut self) -> Result<StoredRecord, StoreError> {
        let mut header = [0u8; FRAME_HEADER_LEN as usize];
        self.reader.read_exact(&mut header)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if len == 0 || len > MAX_FRAME_LEN || FRAME_HEADER_LEN + len > self.remaining {
            return Err(self.corrupt(format!("frame length {len} out of range")));
        }

        let mut payload = vec![0u8; len as usize];
        self.reader.read_exact(&mut payload)?;
        if crc32c(&payload) != crc {
            return Err(self.corrupt("frame checksum mismatch"));
        }
        self.remaining -= FRAME_HEADER_LEN + len;

        serde_json::from_slice(&payload).map_err(|err| self.corrupt(err.to_string()))
    }

    fn corrupt(&self, reason: impl Into<String>) -> StoreError {
        StoreError::Corrupt {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }
}

impl Iterator for SegmentReader {
    type Item = Result<StoredRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.remaining < FRAME_HEADER_LEN {
            return None;
        }
        let result = self.read_frame();
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}

struct SegmentHeader {
    created_at: DateTime<Utc>,
}

fn write_segment_header(
    file: &mut fs::File,
    start_seq: u64,
    created_at: DateTime<Utc>,
) -> io::Result<()> {
    let mut header = vec![0u8; SEGMENT_HEADER_LEN];
    header[0..8].copy_from_slice(SEGMENT_MAGIC);
    header[8..12].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
    header[12..16].copy_from_slice(&(SEGMENT_HEADER_LEN as u32).to_le_bytes());
    header[16..24].copy_from_slice(&created_at.timestamp_millis().to_le_bytes());
    header[24..32].copy_from_slice(&start_seq.to_le_bytes());
    file.write_all(&header)
}

fn read_segment_header(reader: &mut impl Read, path: &Path) -> Result<SegmentHeader, StoreError> {
    let mut header = [0u8; SEGMENT_HEADER_LEN];
    reader.read_exact(&mut header)?;
    if &header[0..8] != SEGMENT_MAGIC {
        return Err(StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: "bad segment magic".to_string(),
        });
    }
    let mut created_ms = [0u8; 8];
    created_ms.copy_from_slice(&header[16..24]);
    let created_at = Utc
        .timestamp_millis_opt(i64::from_le_bytes(created_ms))
        .single()
        .unwrap_or_else(Utc::now);
    Ok(SegmentHeader { created_at })
}

/// Truncates a torn tail so the segment ends on the last complete frame.
/// Returns the resulting length.
fn recover_truncate_tail(
    file: &mut fs::File,
    path: &Path,
    start_seq: u64,
) -> Result<u64, StoreError> {
    let end = file.metadata()?.len();
    if end < SEGMENT_HEADER_LEN as u64 {
        tracing::warn!(path = %path.display(), "segment header incomplete; rewriting");
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write_segment_header(file, start_seq, Utc::now())?;
        file.sync_data()?;
        return Ok(SEGMENT_HEADER_LEN as u64);
    }

    file.seek(SeekFrom::Start(0))?;
    read_segment_header(file, path)?;
    let mut pos = SEGMENT_HEADER_LEN as u64;
    loop {
        let mut header = [0u8; FRAME_HEADER_LEN as usize];
        if file.read_exact(&mut header).is_err() {
            break;
        }
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if len == 0 || len > MAX_FRAME_LEN {
            break;
        }
        let mut payload = vec![0u8; len as usize];
        if file.read_exact(&mut payload).is_err() {
            break;
        }
        if crc32c(&payload) != crc {
            break;
        }
        pos = pos.saturating_add(FRAME_HEADER_LEN + len);
    }

    if pos < end {
        tracing::warn!(
            path = %path.display(),
            dropped_bytes = end - pos,
            "truncated torn segment tail"
        );
    }
    file.set_len(pos)?;
    file.seek(SeekFrom::End(0))?;
    Ok(pos)
}

#[derive(Debug, Clone)]
struct SegmentFile {
    path: PathBuf,
    start_seq: u64,
    open: bool,
}

fn segment_open_path(dir: &Path, start_seq: u64) -> PathBuf {
    dir.join(format!("seg-{start_seq}.open"))
}

fn segment_closed_path(dir: &Path, start_seq: u64, end_seq: u64) -> PathBuf {
    dir.join(format!("seg-{start_seq}-{end_seq}.seg"))
}

fn parse_segment_name(name: &str) -> Option<(u64, bool)> {
    let rest = name.strip_prefix("seg-")?;
    if let Some(start) = rest.strip_suffix(".open") {
        return Some((start.parse().ok()?, true));
    }
    // seg-<start>-<end>.seg
    let range = rest.strip_suffix(".seg")?;
    let (start, end) = range.split_once('-')?;
    end.parse::<u64>().ok()?;
    Some((start.parse().ok()?, false))
}

fn list_segments(dir: &Path) -> io::Result<Vec<SegmentFile>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        let Some((start_seq, open)) = parse_segment_name(name) else {
            continue;
        };
        out.push(SegmentFile {
            path,
            start_seq,
            open,
        });
    }
    Ok(out)
}

fn find_closed_segment(dir: &Path, start_seq: u64) -> io::Result<Option<PathBuf>> {
    Ok(list_segments(dir)?
        .into_iter()
        .find(|seg| !seg.open && seg.start_seq == start_seq)
        .map(|seg| seg.path))
}
