//! Typed tables over a framed log.
//!
//! A table keeps every live row in memory and appends one frame per change
//! to its log. Opening a table replays the log; compaction rewrites it with
//! a single upsert per live row.

use crate::backend::LogBackend;
use crate::error::{StoreError, StoreResult};
use crate::frame::{encode_frame, scan, FrameType};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use syncwell_protocol::{from_cbor, to_cbor};
use tracing::{debug, warn};

/// A record that can live in a [`Table`].
pub trait Row: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// Primary key type.
    type Key: Ord + Clone + Serialize + DeserializeOwned + fmt::Display + Send + Sync;

    /// Returns the row's primary key.
    fn key(&self) -> Self::Key;
}

/// What happened while a table was opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Frames replayed.
    pub frames: u64,
    /// Live rows after replay.
    pub rows: usize,
    /// Bytes of a torn frame dropped from the tail.
    pub truncated_bytes: u64,
}

/// Outcome of a compaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactReport {
    /// Log size before.
    pub bytes_before: u64,
    /// Log size after.
    pub bytes_after: u64,
    /// Superseded frames dropped.
    pub frames_dropped: u64,
}

/// Outcome of a verification scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Complete frames found.
    pub frames: u64,
    /// Rows that replay would produce.
    pub rows: usize,
    /// Bytes of a torn tail frame, if any.
    pub torn_bytes: u64,
    /// Problems found. Empty means the log is clean.
    pub problems: Vec<String>,
}

impl VerifyReport {
    /// Returns true if no problems were found.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// An in-memory table persisted to a framed log.
pub struct Table<R: Row> {
    name: &'static str,
    log: Box<dyn LogBackend>,
    rows: BTreeMap<R::Key, R>,
    frames: u64,
    sync_writes: bool,
}

impl<R: Row> fmt::Debug for Table<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("rows", &self.rows.len())
            .field("frames", &self.frames)
            .finish_non_exhaustive()
    }
}

impl<R: Row> Table<R> {
    /// Opens a table, replaying its log.
    ///
    /// A torn frame at the tail is truncated away. Any other damage fails
    /// the open.
    pub fn open(
        name: &'static str,
        mut log: Box<dyn LogBackend>,
        sync_writes: bool,
    ) -> StoreResult<(Self, ReplayReport)> {
        let data = log.read_all()?;
        let scanned = scan(&data)?;

        if scanned.torn_bytes > 0 {
            warn!(
                table = name,
                torn_bytes = scanned.torn_bytes,
                valid_len = scanned.valid_len,
                "dropping torn frame at log tail"
            );
            log.truncate(scanned.valid_len)?;
        }

        let mut rows = BTreeMap::new();
        for frame in &scanned.frames {
            apply::<R>(&mut rows, frame.frame_type, &frame.payload)
                .map_err(|e| StoreError::corrupted(frame.offset, e.to_string()))?;
        }

        let report = ReplayReport {
            frames: scanned.frames.len() as u64,
            rows: rows.len(),
            truncated_bytes: scanned.torn_bytes,
        };
        debug!(table = name, frames = report.frames, rows = report.rows, "table replayed");

        Ok((
            Self {
                name,
                log,
                rows,
                frames: report.frames,
                sync_writes,
            },
            report,
        ))
    }

    /// Returns the table name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns a row by key.
    pub fn get(&self, key: &R::Key) -> Option<&R> {
        self.rows.get(key)
    }

    /// Returns true if a row with this key exists.
    pub fn contains(&self, key: &R::Key) -> bool {
        self.rows.contains_key(key)
    }

    /// Iterates live rows in key order.
    pub fn values(&self) -> impl Iterator<Item = &R> {
        self.rows.values()
    }

    /// Returns the number of live rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the table holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns the number of log frames that no longer describe a live row.
    #[must_use]
    pub fn dead_frames(&self) -> u64 {
        self.frames.saturating_sub(self.rows.len() as u64)
    }

    /// Returns the log size in bytes.
    pub fn log_size(&self) -> StoreResult<u64> {
        self.log.size()
    }

    /// Inserts or replaces a row. The frame is written before the
    /// in-memory copy changes.
    pub fn upsert(&mut self, row: R) -> StoreResult<()> {
        let payload = to_cbor(&row)?;
        self.append(FrameType::Upsert, &payload)?;
        self.rows.insert(row.key(), row);
        Ok(())
    }

    /// Removes a row, returning it if it existed.
    pub fn remove(&mut self, key: &R::Key) -> StoreResult<Option<R>> {
        if !self.rows.contains_key(key) {
            return Ok(None);
        }
        let payload = to_cbor(key)?;
        self.append(FrameType::Remove, &payload)?;
        Ok(self.rows.remove(key))
    }

    fn append(&mut self, frame_type: FrameType, payload: &[u8]) -> StoreResult<()> {
        let frame = encode_frame(frame_type, payload)?;
        self.log.append(&frame)?;
        if self.sync_writes {
            self.log.sync()?;
        } else {
            self.log.flush()?;
        }
        self.frames += 1;
        Ok(())
    }

    /// Rewrites the log with one upsert frame per live row.
    pub fn compact(&mut self) -> StoreResult<CompactReport> {
        let bytes_before = self.log.size()?;
        let mut data = Vec::new();
        for row in self.rows.values() {
            data.extend_from_slice(&encode_frame(FrameType::Upsert, &to_cbor(row)?)?);
        }
        self.log.replace(&data)?;

        let report = CompactReport {
            bytes_before,
            bytes_after: data.len() as u64,
            frames_dropped: self.dead_frames(),
        };
        self.frames = self.rows.len() as u64;
        debug!(
            table = self.name,
            bytes_before = report.bytes_before,
            bytes_after = report.bytes_after,
            frames_dropped = report.frames_dropped,
            "table compacted"
        );
        Ok(report)
    }

    /// Re-reads the log and checks that every frame decodes and that replay
    /// reproduces the in-memory rows.
    pub fn verify(&self) -> StoreResult<VerifyReport> {
        let data = self.log.read_all()?;
        let mut report = VerifyReport::default();

        let scanned = match scan(&data) {
            Ok(scanned) => scanned,
            Err(e) => {
                report.problems.push(format!("{}: {e}", self.name));
                return Ok(report);
            }
        };
        report.frames = scanned.frames.len() as u64;
        report.torn_bytes = scanned.torn_bytes;
        if scanned.torn_bytes > 0 {
            report
                .problems
                .push(format!("{}: torn frame of {} bytes at tail", self.name, scanned.torn_bytes));
        }

        let mut replayed: BTreeMap<R::Key, R> = BTreeMap::new();
        for frame in &scanned.frames {
            if let Err(e) = apply::<R>(&mut replayed, frame.frame_type, &frame.payload) {
                report
                    .problems
                    .push(format!("{}: frame at {} does not decode: {e}", self.name, frame.offset));
            }
        }
        report.rows = replayed.len();

        for key in self.rows.keys() {
            if !replayed.contains_key(key) {
                report
                    .problems
                    .push(format!("{}: row {key} missing from log", self.name));
            }
        }
        for key in replayed.keys() {
            if !self.rows.contains_key(key) {
                report
                    .problems
                    .push(format!("{}: log holds removed row {key}", self.name));
            }
        }
        Ok(report)
    }
}

fn apply<R: Row>(
    rows: &mut BTreeMap<R::Key, R>,
    frame_type: FrameType,
    payload: &[u8],
) -> StoreResult<()> {
    match frame_type {
        FrameType::Upsert => {
            let row: R = from_cbor(payload)?;
            rows.insert(row.key(), row);
        }
        FrameType::Remove => {
            let key: R::Key = from_cbor(payload)?;
            rows.remove(&key);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryLog;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: u32,
        text: String,
    }

    impl Row for Note {
        type Key = u32;
        fn key(&self) -> u32 {
            self.id
        }
    }

    fn note(id: u32, text: &str) -> Note {
        Note {
            id,
            text: text.into(),
        }
    }

    fn open(log: &MemoryLog) -> (Table<Note>, ReplayReport) {
        Table::open("notes", Box::new(log.clone()), false).unwrap()
    }

    #[test]
    fn replay_restores_rows() {
        let log = MemoryLog::new();
        {
            let (mut table, _) = open(&log);
            table.upsert(note(1, "a")).unwrap();
            table.upsert(note(2, "b")).unwrap();
            table.upsert(note(1, "a2")).unwrap();
            table.remove(&2).unwrap();
        }

        let (table, report) = open(&log);
        assert_eq!(report.frames, 4);
        assert_eq!(report.rows, 1);
        assert_eq!(table.get(&1), Some(&note(1, "a2")));
        assert!(!table.contains(&2));
        assert_eq!(table.dead_frames(), 3);
    }

    #[test]
    fn removing_missing_row_writes_nothing() {
        let log = MemoryLog::new();
        let (mut table, _) = open(&log);
        assert!(table.remove(&9).unwrap().is_none());
        assert!(log.snapshot().is_empty());
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let log = MemoryLog::new();
        {
            let (mut table, _) = open(&log);
            table.upsert(note(1, "kept")).unwrap();
        }
        let good_len = log.snapshot().len();
        let mut torn = log.snapshot();
        let extra = encode_frame(FrameType::Upsert, &to_cbor(&note(2, "lost")).unwrap()).unwrap();
        torn.extend_from_slice(&extra[..extra.len() / 2]);
        let log = MemoryLog::with_data(torn);

        let (table, report) = open(&log);
        assert_eq!(report.truncated_bytes, (extra.len() / 2) as u64);
        assert_eq!(table.len(), 1);
        assert_eq!(log.snapshot().len(), good_len);
    }

    #[test]
    fn compaction_keeps_rows_and_shrinks_log() {
        let log = MemoryLog::new();
        let (mut table, _) = open(&log);
        for i in 0..10 {
            table.upsert(note(1, &format!("rev {i}"))).unwrap();
        }
        table.upsert(note(2, "other")).unwrap();

        let report = table.compact().unwrap();
        assert_eq!(report.frames_dropped, 9);
        assert!(report.bytes_after < report.bytes_before);
        assert_eq!(table.dead_frames(), 0);

        let (reopened, replay) = open(&log);
        assert_eq!(replay.frames, 2);
        assert_eq!(reopened.get(&1).unwrap().text, "rev 9");
    }

    #[test]
    fn open_rejects_undecodable_frame() {
        let mut data = encode_frame(FrameType::Upsert, &to_cbor(&note(1, "ok")).unwrap()).unwrap();
        data.extend_from_slice(&encode_frame(FrameType::Upsert, b"\xff\xff").unwrap());
        let log = MemoryLog::with_data(data);

        let err = Table::<Note>::open("notes", Box::new(log), false).unwrap_err();
        assert!(matches!(err, StoreError::Corrupted { .. }));
    }

    #[test]
    fn verify_reports_clean_log() {
        let log = MemoryLog::new();
        let (mut table, _) = open(&log);
        table.upsert(note(1, "a")).unwrap();
        table.upsert(note(2, "b")).unwrap();
        table.remove(&1).unwrap();

        let report = table.verify().unwrap();
        assert!(report.is_clean(), "{:?}", report.problems);
        assert_eq!(report.frames, 3);
        assert_eq!(report.rows, 1);
    }
}
